//! [`PlatformApi`] and [`HealthSource`] over a live API server

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::drain::{evict_node_pods, DrainOptions};
use super::exec::{host_command_pod, host_command_pod_name, HOST_COMMAND_NAMESPACE};
use super::{NodeInfo, PlatformApi};
use crate::health::{Health, HealthSource};
use crate::{Error, Result};

/// Interval for polling host-command pod completion
const HOST_COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Real platform implementation wrapping a shared kube [`Client`]
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    drain: DrainOptions,
}

impl KubePlatform {
    /// Create a platform over the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            drain: DrainOptions::default(),
        }
    }

    /// Override drain tuning
    pub fn with_drain_options(mut self, drain: DrainOptions) -> Self {
        self.drain = drain;
        self
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn wait_for_pod_completion(
        &self,
        pods: &Api<Pod>,
        name: &str,
        timeout: Duration,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let phase = pods
                .get(name)
                .await?
                .status
                .and_then(|s| s.phase)
                .unwrap_or_default();
            if phase == "Succeeded" || phase == "Failed" {
                return Ok(phase);
            }
            if Instant::now() + HOST_COMMAND_POLL_INTERVAL > deadline {
                return Err(Error::timeout(format!("host command pod {name}"), timeout));
            }
            tokio::time::sleep(HOST_COMMAND_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl PlatformApi for KubePlatform {
    async fn ping(&self) -> bool {
        match self.client.apiserver_version().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "API server not reachable");
                false
            }
        }
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(NodeInfo::from).collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes().get_opt(name).await?.as_ref().map(NodeInfo::from))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = %name, "deleted node");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        self.set_unschedulable(name, true).await
    }

    async fn uncordon(&self, name: &str) -> Result<()> {
        self.set_unschedulable(name, false).await
    }

    async fn drain(&self, name: &str, timeout: Duration) -> Result<()> {
        self.cordon(name)
            .await
            .map_err(|e| Error::drain(name, format!("cordon: {e}")))?;

        match tokio::time::timeout(
            timeout,
            evict_node_pods(&self.client, name, timeout, &self.drain),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("drain of node {name}"), timeout)),
        }
    }

    async fn run_on_node(&self, name: &str, script: &str, timeout: Duration) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), HOST_COMMAND_NAMESPACE);
        let pod_name = host_command_pod_name(name);
        let pod = host_command_pod(&pod_name, name, script)?;

        pods.create(&PostParams::default(), &pod).await?;
        debug!(node = %name, pod = %pod_name, "started host command");

        let outcome = self.wait_for_pod_completion(&pods, &pod_name, timeout).await;
        let logs = pods
            .logs(&pod_name, &LogParams::default())
            .await
            .unwrap_or_default();

        if let Err(e) = pods.delete(&pod_name, &DeleteParams::default()).await {
            warn!(pod = %pod_name, error = %e, "failed to clean up host command pod");
        }

        match outcome?.as_str() {
            "Succeeded" => Ok(logs),
            phase => Err(Error::provider(format!(
                "host command on {name} ended in phase {phase}: {}",
                logs.trim()
            ))),
        }
    }

    async fn remove_taint(&self, name: &str, key: &str) -> Result<()> {
        let Some(node) = self.nodes().get_opt(name).await? else {
            return Ok(());
        };
        let taints = node
            .spec
            .and_then(|s| s.taints)
            .unwrap_or_default();
        if !taints.iter().any(|t| t.key == key) {
            return Ok(());
        }

        let kept: Vec<_> = taints.into_iter().filter(|t| t.key != key).collect();
        let patch = json!({ "spec": { "taints": kept } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(node = %name, taint = %key, "removed taint");
        Ok(())
    }
}

#[async_trait]
impl HealthSource for KubePlatform {
    async fn health(&self) -> Result<Health> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;
        Ok(count_health(&list.items))
    }
}

/// Count running and crash-looping pods
pub(crate) fn count_health(pods: &[Pod]) -> Health {
    let mut health = Health::default();
    for pod in pods {
        let Some(status) = pod.status.as_ref() else {
            continue;
        };
        if status.phase.as_deref() == Some("Running") {
            health.running_pods += 1;
        }
        let crash_looping = status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
            .any(|c| {
                c.state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.as_deref())
                    == Some("CrashLoopBackOff")
            });
        if crash_looping {
            health.crash_loop_back_off += 1;
        }
    }
    health
}
