//! One-shot host commands via a pinned privileged pod
//!
//! The pod runs on the target node with host PID/network and `nsenter`s into
//! PID 1's namespaces, so the script sees the host exactly as an SSH session
//! would. No SSH keys or direct routability are needed; the command travels
//! over the API server like any other pod.

use k8s_openapi::api::core::v1::Pod;
use serde_json::json;

use crate::{Error, Result};

/// Namespace host-command pods are created in
pub const HOST_COMMAND_NAMESPACE: &str = "kube-system";

/// Image used for host-command pods (only needs `nsenter` and `sh`)
const HOST_COMMAND_IMAGE: &str = "docker.io/library/alpine:3.20";

/// Build the pod that runs `script` on `node`.
pub fn host_command_pod(pod_name: &str, node: &str, script: &str) -> Result<Pod> {
    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": HOST_COMMAND_NAMESPACE,
            "labels": {
                "app.kubernetes.io/managed-by": "fleet",
                "fleet.dev/host-command": "true"
            }
        },
        "spec": {
            "nodeName": node,
            "hostPID": true,
            "hostNetwork": true,
            "restartPolicy": "Never",
            "terminationGracePeriodSeconds": 0,
            "tolerations": [{ "operator": "Exists" }],
            "containers": [{
                "name": "host",
                "image": HOST_COMMAND_IMAGE,
                "command": [
                    "nsenter", "--target", "1", "--mount", "--uts", "--ipc", "--net", "--pid",
                    "--", "sh", "-c", script
                ],
                "securityContext": { "privileged": true }
            }]
        }
    });
    serde_json::from_value(pod).map_err(|e| Error::serialization(format!("host command pod: {e}")))
}

/// Pod name for a host command on `node`; a random suffix keeps concurrent
/// commands apart
pub(crate) fn host_command_pod_name(node: &str) -> String {
    let suffix = crate::names::random_suffix();
    let mut base = format!("fleet-exec-{node}");
    // pod names are DNS subdomains capped at 253, keep well under
    base.truncate(200);
    format!("{base}-{suffix}")
}
