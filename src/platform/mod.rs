//! Orchestrated-platform (Kubernetes) operations
//!
//! The reconciler and rolling engine never talk to the API server directly;
//! they go through [`PlatformApi`] so they can be exercised against fakes.
//! [`KubePlatform`] is the real implementation.

mod client;
mod drain;
mod exec;

pub use client::KubePlatform;
pub use drain::DrainOptions;
pub use exec::{host_command_pod, HOST_COMMAND_NAMESPACE};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Label marking control-plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
/// Legacy control-plane label still set by older kubeadm versions
pub const LEGACY_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// The parts of a Node record the orchestrator cares about
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Carries a control-plane role label
    pub is_master: bool,
    /// Ready condition is True
    pub ready: bool,
    /// Cordoned
    pub unschedulable: bool,
    /// kubelet version reported in node status (e.g. "v1.31.2")
    pub kubelet_version: Option<String>,
    /// Internal IP reported in node status
    pub internal_ip: Option<String>,
    /// Node object creation time
    pub created: Option<DateTime<Utc>>,
    /// Taint keys
    pub taints: Vec<String>,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        let labels = node.metadata.labels.as_ref();
        let is_master = labels
            .map(|l| l.contains_key(CONTROL_PLANE_LABEL) || l.contains_key(LEGACY_MASTER_LABEL))
            .unwrap_or(false);

        let status = node.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);
        let kubelet_version = status
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.kubelet_version.clone());
        let internal_ip = status
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone());

        let spec = node.spec.as_ref();
        let unschedulable = spec.and_then(|s| s.unschedulable).unwrap_or(false);
        let taints = spec
            .and_then(|s| s.taints.as_ref())
            .map(|t| t.iter().map(|taint| taint.key.clone()).collect())
            .unwrap_or_default();

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            is_master,
            ready,
            unschedulable,
            kubelet_version,
            internal_ip,
            created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
            taints,
        }
    }
}

/// Kubernetes operations used by the orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Whether the API server answers
    async fn ping(&self) -> bool;

    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// One node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>>;

    /// Delete a node record; deleting a missing node succeeds
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Mark a node unschedulable
    async fn cordon(&self, name: &str) -> Result<()>;

    /// Mark a node schedulable
    async fn uncordon(&self, name: &str) -> Result<()>;

    /// Cordon and evict workloads, bounded by `timeout`
    async fn drain(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Run a shell script in the host namespaces of a node, returning its output
    async fn run_on_node(&self, name: &str, script: &str, timeout: Duration) -> Result<String>;

    /// Remove a taint by key; a node without the taint is left untouched
    async fn remove_taint(&self, name: &str, key: &str) -> Result<()>;
}

/// Node names carrying a control-plane role
pub async fn master_node_names(platform: &dyn PlatformApi) -> Result<Vec<String>> {
    let mut names: Vec<String> = platform
        .list_nodes()
        .await?
        .into_iter()
        .filter(|n| n.is_master)
        .map(|n| n.name)
        .collect();
    names.sort();
    Ok(names)
}

/// Order nodes oldest first by creation time, unknown ages first, ties by name
pub fn sort_nodes_oldest_first(nodes: &mut [NodeInfo]) {
    nodes.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
}
