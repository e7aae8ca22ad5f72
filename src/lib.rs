//! Fleet - Kubernetes cluster lifecycle on plain virtual machines
//!
//! Fleet converges a declared topology (masters plus named worker pools) onto
//! a virtualization backend, keeps the control-plane endpoint discoverable,
//! and performs the day-2 operations that need care around etcd and running
//! workloads.
//!
//! # Architecture
//!
//! - Provisioning is reconcile-driven: every run compares machines and nodes
//!   with the configuration and converges them, so re-running is always safe
//! - Backends are traits (machines, bootstrap payloads, discovery, DNS, load
//!   balancers); only the Kubernetes side ships a real implementation
//! - etcd is reached through API-server port-forwards, never directly
//!
//! # Modules
//!
//! - [`config`] - Fleet configuration file
//! - [`machine`] - Virtual machine and provider abstractions
//! - [`bootstrap`] - Per-role bootstrap payloads
//! - [`discovery`] - Control-plane endpoint strategies
//! - [`hooks`] - Provisioning lifecycle hooks
//! - [`reconcile`] - Desired-vs-actual convergence and teardown
//! - [`rolling`] - Rolling restart and upgrade
//! - [`etcd`] - etcd client generator and maintenance
//! - [`platform`] - Kubernetes node operations
//! - [`health`] - Cluster health snapshots
//! - [`taint`] - Background startup-taint removal
//! - [`session`] - Shared API-server clients
//! - [`retry`] - Backoff and polling helpers
//! - [`names`] - Machine naming
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod etcd;
pub mod health;
pub mod hooks;
pub mod machine;
pub mod names;
pub mod platform;
pub mod reconcile;
pub mod retry;
pub mod rolling;
pub mod session;
pub mod taint;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Environment variable naming the fleet configuration file
pub const CONFIG_ENV: &str = "FLEET_CONFIG";

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "fleet.yaml";
