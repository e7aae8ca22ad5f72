//! Node drain: cordon, evict, wait for the pods to go away
//!
//! Evictions go through the Eviction API so PodDisruptionBudgets are honoured.
//! A PDB-blocked eviction (HTTP 429) is retried until the deadline.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, EvictParams, ListParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Annotation set on static (mirror) pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Drain tuning
#[derive(Clone, Debug)]
pub struct DrainOptions {
    /// Interval between eviction retries and disappearance checks
    pub poll_interval: Duration,
    /// Grace period passed to each eviction (None = pod's own)
    pub grace_period_seconds: Option<u32>,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            grace_period_seconds: None,
        }
    }
}

/// Whether a pod should be evicted when draining its node.
///
/// DaemonSet pods would be recreated on the same node, mirror pods cannot be
/// evicted through the API, and finished pods hold no capacity.
pub(crate) fn is_evictable(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false);
    if owned_by_daemonset {
        return false;
    }

    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false);
    if is_mirror {
        return false;
    }

    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

async fn evictable_pods(client: &Client, node: &str) -> Result<Vec<(String, String)>> {
    let pods: Api<Pod> = Api::all(client.clone());
    let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
    let list = pods.list(&params).await?;

    Ok(list
        .items
        .iter()
        .filter(|p| is_evictable(p))
        .filter_map(|p| {
            Some((
                p.metadata.namespace.clone()?,
                p.metadata.name.clone()?,
            ))
        })
        .collect())
}

/// Evict every evictable pod on `node` and wait until they are gone.
///
/// The caller is responsible for cordoning first.
pub(crate) async fn evict_node_pods(
    client: &Client,
    node: &str,
    timeout: Duration,
    options: &DrainOptions,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let params = EvictParams {
        delete_options: options.grace_period_seconds.map(|g| kube::api::DeleteParams {
            grace_period_seconds: Some(g),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut pending = evictable_pods(client, node).await?;
    info!(node = %node, pods = pending.len(), "evicting pods");

    while !pending.is_empty() {
        let mut blocked = Vec::new();
        for (namespace, name) in pending {
            let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
            match api.evict(&name, &params).await {
                Ok(_) => debug!(node = %node, pod = %name, namespace = %namespace, "evicted"),
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(kube::Error::Api(resp)) if resp.code == 429 => {
                    debug!(pod = %name, namespace = %namespace, "eviction blocked by disruption budget");
                    blocked.push((namespace, name));
                }
                Err(e) => return Err(Error::drain(node, format!("evicting {namespace}/{name}: {e}"))),
            }
        }

        if blocked.is_empty() {
            break;
        }
        if Instant::now() + options.poll_interval > deadline {
            let names: Vec<String> = blocked.iter().map(|(ns, n)| format!("{ns}/{n}")).collect();
            return Err(Error::drain(
                node,
                format!("evictions still blocked at deadline: {}", names.join(", ")),
            ));
        }
        tokio::time::sleep(options.poll_interval).await;
        pending = blocked;
    }

    loop {
        let remaining = evictable_pods(client, node).await?;
        if remaining.is_empty() {
            info!(node = %node, "drained");
            return Ok(());
        }
        if Instant::now() + options.poll_interval > deadline {
            warn!(node = %node, remaining = remaining.len(), "pods still terminating at drain deadline");
            return Err(Error::timeout(format!("pods to leave node {node}"), timeout));
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}
