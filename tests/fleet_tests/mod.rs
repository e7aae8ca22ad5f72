//! Stories about converging and maintaining a fleet
//!
//! # Test Organization
//!
//! - `reconcile`: Stories about bringing a cluster from nothing to its declared
//!   topology, keeping it there, scaling pools, and tearing it down
//!
//! - `rolling`: Stories about rebooting and upgrading nodes one at a time
//!   while keeping an eye on cluster health
//!
//! - `fakes`: The in-memory provider and platform both suites run against

mod fakes;
mod reconcile;
mod rolling;
