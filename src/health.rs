//! Cluster-wide health snapshots
//!
//! The rolling engine captures a [`Health`] baseline before touching any node
//! and, after each node, waits until the cluster is no longer degraded
//! relative to it.

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Pod health counts for the whole cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Health {
    /// Pods in phase Running
    pub running_pods: u32,
    /// Pods with a container waiting in CrashLoopBackOff
    pub crash_loop_back_off: u32,
}

impl Health {
    /// Whether this snapshot is worse than `baseline`.
    ///
    /// Degraded iff fewer pods are running, or more than `tolerance` additional
    /// pods are crash-looping. Equal or better health is never degraded.
    pub fn is_degraded_compared_to(&self, baseline: &Health, tolerance: u32) -> bool {
        self.running_pods < baseline.running_pods
            || self.crash_loop_back_off > baseline.crash_loop_back_off.saturating_add(tolerance)
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "running={} crashloop={}",
            self.running_pods, self.crash_loop_back_off
        )
    }
}

/// Source of cluster health snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Current pod health counts
    async fn health(&self) -> Result<Health>;
}
