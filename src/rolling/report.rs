//! Per-node states and the run report

use std::fmt;

use serde::Serialize;

/// Where a node is in its maintenance sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    /// Picked for maintenance
    Selected,
    /// Cluster health baseline available for comparison
    HealthSnapshotted,
    /// Cordoned, workloads being evicted
    Draining,
    /// Reboot (or upgrade then reboot) issued
    Rebooting,
    /// Waiting for the node to drop out of Ready
    AwaitingNotReady,
    /// Waiting for the node to come back Ready
    AwaitingReady,
    /// Making the node schedulable again
    Uncordoning,
    /// Cluster health back at or above baseline (or budget spent)
    HealthVerified,
    /// Finished
    Done,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Selected => "selected",
            NodeState::HealthSnapshotted => "health-snapshotted",
            NodeState::Draining => "draining",
            NodeState::Rebooting => "rebooting",
            NodeState::AwaitingNotReady => "awaiting-not-ready",
            NodeState::AwaitingReady => "awaiting-ready",
            NodeState::Uncordoning => "uncordoning",
            NodeState::HealthVerified => "health-verified",
            NodeState::Done => "done",
        };
        f.write_str(s)
    }
}

/// The states one node went through
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeRun {
    /// Node name
    pub node: String,
    /// States entered, in order
    pub states: Vec<NodeState>,
}

impl NodeRun {
    pub(crate) fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            states: vec![NodeState::Selected],
        }
    }

    /// Last state entered
    pub fn state(&self) -> NodeState {
        self.states.last().copied().unwrap_or(NodeState::Selected)
    }
}

/// A node left untouched
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedNode {
    /// Node name
    pub node: String,
    /// Why
    pub reason: String,
}

/// Outcome of a rolling restart or upgrade
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RollingReport {
    /// Nodes processed, in order
    pub runs: Vec<NodeRun>,
    /// Nodes not processed
    pub skipped: Vec<SkippedNode>,
    /// Failures tolerated because of force mode
    pub forced: Vec<String>,
    /// Nodes after which health did not recover within budget
    pub health_warnings: Vec<String>,
}

impl RollingReport {
    /// Names of processed nodes, in order
    pub fn processed(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.node.as_str()).collect()
    }

    pub(crate) fn skip(&mut self, node: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedNode {
            node: node.to_string(),
            reason: reason.into(),
        });
    }
}

impl fmt::Display for RollingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} skipped, {} forced past failures, {} health warnings",
            self.runs.len(),
            self.skipped.len(),
            self.forced.len(),
            self.health_warnings.len()
        )
    }
}
