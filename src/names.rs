//! Machine naming
//!
//! Machines are named `<cluster>-<pool>-<suffix>` where the suffix is five
//! random lowercase alphanumerics. Pool membership is decided by prefix plus a
//! dash-free suffix, so pool `gpu` never claims `gpu-large`'s machines.

use rand::distributions::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 5;

/// Five random lowercase alphanumerics
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// New machine name under `prefix`
pub fn machine_name(prefix: &str) -> String {
    format!("{prefix}{}", random_suffix())
}

/// Whether `name` is a machine of the pool owning `prefix`
pub fn in_pool(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .map(|suffix| !suffix.is_empty() && !suffix.contains('-'))
        .unwrap_or(false)
}
