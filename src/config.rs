//! Fleet configuration
//!
//! A single YAML document declares the desired topology (masters and named
//! worker pools), the discovery strategy, and every timeout the orchestrator
//! uses. Field names are camelCase, matching the rest of the Kubernetes
//! ecosystem.
//!
//! ```yaml
//! name: prod
//! kubernetesVersion: v1.31.2
//! masters:
//!   count: 3
//!   template: ubuntu-2204-k8s
//! pools:
//!   workers:
//!     count: 5
//!     template: ubuntu-2204-k8s
//! discovery:
//!   kind: consul
//!   address: http://consul.internal:8500
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name fragment reserved for master machines (`<cluster>-master-<suffix>`)
pub const MASTER_POOL: &str = "master";

/// Top-level fleet configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Cluster name; prefixes every machine name
    pub name: String,
    /// Target Kubernetes version for upgrades (e.g. "v1.31.2")
    pub kubernetes_version: String,
    /// Control-plane machines
    pub masters: MachineTemplate,
    /// Worker pools by name
    #[serde(default)]
    pub pools: BTreeMap<String, MachineTemplate>,
    /// How the control-plane endpoint is located and published
    pub discovery: DiscoveryConfig,
    /// Wait budgets
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Parallel provisioning settings
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    /// Rolling restart/upgrade settings
    #[serde(default)]
    pub rolling: RollingConfig,
    /// TLS material for talking to etcd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdTlsFiles>,
}

/// Desired count and shape of a group of machines
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Desired number of machines
    pub count: u32,
    /// Provider template/image to clone from
    pub template: String,
    /// vCPUs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Memory in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<u32>,
    /// Root disk in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u32>,
    /// Network/port group to attach
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Extra provider tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Master discovery strategy selection
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiscoveryConfig {
    /// Service-registry health checks (Consul)
    #[serde(rename_all = "camelCase")]
    Consul {
        /// Registry base URL
        address: String,
        /// Service name masters register under (defaults to the cluster name)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
    },
    /// L4 load balancers on the virtual network plus DNS records
    #[serde(rename_all = "camelCase")]
    LoadBalancer {
        /// DNS name for the control-plane VIP
        master_dns: String,
        /// DNS name for the ingress VIP
        ingress_dns: String,
        /// Ingress ports balanced by the worker load balancer
        #[serde(default = "default_ingress_ports")]
        ingress_ports: Vec<u16>,
    },
    /// Fixed loopback endpoint for local/ephemeral clusters
    Static,
    /// DNS round-robin of master/worker IPs
    #[serde(rename_all = "camelCase")]
    Dns {
        /// Name every master IP is appended to
        master_dns: String,
        /// Name every worker IP is appended to (wildcard ingress)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_dns: Option<String>,
    },
}

impl DiscoveryConfig {
    /// Short name of the strategy
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryConfig::Consul { .. } => "consul",
            DiscoveryConfig::LoadBalancer { .. } => "loadBalancer",
            DiscoveryConfig::Static => "static",
            DiscoveryConfig::Dns { .. } => "dns",
        }
    }
}

fn default_ingress_ports() -> Vec<u16> {
    vec![80, 443]
}

/// Wait budgets, in seconds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Wait for a new instance to report a routable address
    pub ip_secs: u64,
    /// Wait for the control plane to answer after the primary master boots
    pub control_plane_secs: u64,
    /// Drain budget, also used for the not-ready wait during rolling ops
    pub drain_secs: u64,
    /// Wait for a rebooted node to report Ready
    pub ready_secs: u64,
    /// Total budget for post-node health recovery
    pub health_budget_secs: u64,
    /// Interval between health checks
    pub health_interval_secs: u64,
    /// Budget for opening a tunneled etcd connection
    pub etcd_dial_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ip_secs: 300,
            control_plane_secs: 900,
            drain_secs: 300,
            ready_secs: 900,
            health_budget_secs: 300,
            health_interval_secs: 10,
            etcd_dial_secs: 15,
        }
    }
}

impl TimeoutConfig {
    /// Instance address wait
    pub fn ip(&self) -> Duration {
        Duration::from_secs(self.ip_secs)
    }

    /// Control-plane reachability wait
    pub fn control_plane(&self) -> Duration {
        Duration::from_secs(self.control_plane_secs)
    }

    /// Drain budget
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }

    /// Ready wait after reboot
    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    /// Health recovery budget
    pub fn health_budget(&self) -> Duration {
        Duration::from_secs(self.health_budget_secs)
    }

    /// Health poll interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Etcd dial budget
    pub fn etcd_dial(&self) -> Duration {
        Duration::from_secs(self.etcd_dial_secs)
    }
}

/// Parallel provisioning settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisioningConfig {
    /// Maximum concurrent clone/terminate operations
    pub concurrency: usize,
    /// Delay between consecutive launches, in milliseconds
    pub stagger_ms: u64,
    /// Abort reconcile if a pool has more never-joined machines than this
    pub max_orphans: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            stagger_ms: 2000,
            max_orphans: 5,
        }
    }
}

impl ProvisioningConfig {
    /// Launch stagger
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

/// Rolling restart/upgrade settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RollingConfig {
    /// Continue past drain and not-ready failures
    pub force: bool,
    /// Extra CrashLoopBackOff pods tolerated relative to the baseline
    pub crash_loop_tolerance: u32,
    /// Host command that upgrades a node; `{version}` is substituted
    pub upgrade_command: String,
    /// Taint removed by the taint remover once a node is Ready
    pub startup_taint: String,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            force: false,
            crash_loop_tolerance: 0,
            upgrade_command: "kubeadm upgrade node && apt-get install -y kubelet={version}-*"
                .to_string(),
            startup_taint: "node.fleet.dev/initializing".to_string(),
        }
    }
}

/// Paths to etcd client TLS material
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdTlsFiles {
    /// CA bundle that signed the etcd serving certificates
    pub ca_file: PathBuf,
    /// Client certificate
    pub cert_file: PathBuf,
    /// Client private key
    pub key_file: PathBuf,
}

impl FleetConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name).map_err(|e| Error::config(format!("cluster name: {e}")))?;

        if self.masters.count == 0 {
            return Err(Error::config("masters.count must be at least 1"));
        }
        if self.masters.template.is_empty() {
            return Err(Error::config("masters.template is required"));
        }

        for (pool, template) in &self.pools {
            validate_name(pool).map_err(|e| Error::config(format!("pool {pool:?}: {e}")))?;
            if pool == MASTER_POOL {
                return Err(Error::config(format!(
                    "pool name {MASTER_POOL:?} is reserved for control-plane machines"
                )));
            }
            if template.template.is_empty() {
                return Err(Error::config(format!("pool {pool:?}: template is required")));
            }
        }

        if self.provisioning.concurrency == 0 {
            return Err(Error::config("provisioning.concurrency must be at least 1"));
        }
        if self.timeouts.health_interval_secs == 0 {
            return Err(Error::config("timeouts.healthIntervalSecs must be at least 1"));
        }

        Ok(())
    }

    /// Machine name prefix for masters
    pub fn master_prefix(&self) -> String {
        pool_prefix(&self.name, MASTER_POOL)
    }

    /// Machine name prefix for a worker pool
    pub fn pool_prefix(&self, pool: &str) -> String {
        pool_prefix(&self.name, pool)
    }
}

/// `<cluster>-<pool>-`
pub fn pool_prefix(cluster: &str, pool: &str) -> String {
    format!("{cluster}-{pool}-")
}

/// DNS-label rules: lowercase alphanumerics and '-', not leading/trailing '-'
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".into());
    }
    if name.len() > 40 {
        return Err("must be at most 40 characters".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!("{name:?} contains characters outside [a-z0-9-]"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("{name:?} must not start or end with '-'"));
    }
    Ok(())
}
