//! Virtual-network load balancer discovery
//!
//! Two L4 load balancers front the cluster: `<cluster>-masters` balances the
//! API server port, `<cluster>-workers` the ingress ports. Membership is by
//! provider tag, which [`LoadBalancerDiscovery`] stamps onto every machine
//! spec before cloning. Each virtual IP is then published under a DNS name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use super::{DnsClient, MasterDiscovery, API_SERVER_PORT};
use crate::hooks::{HookContext, ProvisionHook};
use crate::machine::MachineSpec;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Tag selecting which load balancer a machine joins
pub const LB_ROLE_TAG: &str = "fleet/lb-role";

const MASTERS_ROLE: &str = "masters";
const WORKERS_ROLE: &str = "workers";
const DNS_ATTEMPTS: u32 = 5;

/// A provisioned load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Unique name
    pub name: String,
    /// Allocated virtual IP
    pub vip: String,
}

/// What to create when no balancer of the name exists
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerRequest {
    /// Unique name
    pub name: String,
    /// Balanced ports
    pub ports: Vec<u16>,
    /// Members are machines carrying these tags
    pub member_tags: BTreeMap<String, String>,
}

/// Virtual-network load balancer API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Look a balancer up by exact name
    async fn find(&self, name: &str) -> Result<Option<LoadBalancer>>;

    /// Create a balancer and allocate its virtual IP
    async fn create(&self, request: &LoadBalancerRequest) -> Result<LoadBalancer>;
}

#[derive(Clone, Debug)]
struct Vips {
    masters: String,
    ingress: String,
}

/// Load-balancer backed discovery
pub struct LoadBalancerDiscovery {
    cluster: String,
    lbs: Arc<dyn LoadBalancerApi>,
    dns: Arc<dyn DnsClient>,
    master_dns: String,
    ingress_dns: String,
    ingress_ports: Vec<u16>,
    ensured: Mutex<Option<Vips>>,
    retry: RetryConfig,
}

impl LoadBalancerDiscovery {
    /// Strategy for `cluster`, publishing VIPs under the given names
    pub fn new(
        cluster: &str,
        lbs: Arc<dyn LoadBalancerApi>,
        dns: Arc<dyn DnsClient>,
        master_dns: &str,
        ingress_dns: &str,
        ingress_ports: Vec<u16>,
    ) -> Self {
        Self {
            cluster: cluster.to_string(),
            lbs,
            dns,
            master_dns: master_dns.to_string(),
            ingress_dns: ingress_dns.to_string(),
            ingress_ports,
            ensured: Mutex::new(None),
            retry: RetryConfig::with_max_attempts(DNS_ATTEMPTS),
        }
    }

    /// Override DNS retry settings
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn find_or_create(&self, role: &str, ports: Vec<u16>) -> Result<LoadBalancer> {
        let name = format!("{}-{}", self.cluster, role);
        if let Some(existing) = self.lbs.find(&name).await? {
            return Ok(existing);
        }
        let request = LoadBalancerRequest {
            name: name.clone(),
            ports,
            member_tags: BTreeMap::from([
                (LB_ROLE_TAG.to_string(), role.to_string()),
                ("fleet/cluster".to_string(), self.cluster.clone()),
            ]),
        };
        let lb = self.lbs.create(&request).await?;
        info!(name = %lb.name, vip = %lb.vip, "created load balancer");
        Ok(lb)
    }

    async fn publish(&self, record: &str, vip: &str) -> Result<()> {
        retry_with_backoff(&self.retry, "dns upsert", || self.dns.upsert(record, vip))
            .await
            .map_err(|e| Error::discovery(format!("publishing {record} -> {vip}: {e}")))
    }

    /// Create both balancers and their DNS records once per process
    async fn ensure(&self) -> Result<Vips> {
        let mut ensured = self.ensured.lock().await;
        if let Some(vips) = ensured.as_ref() {
            return Ok(vips.clone());
        }

        let masters = self
            .find_or_create(MASTERS_ROLE, vec![API_SERVER_PORT])
            .await?;
        let ingress = self
            .find_or_create(WORKERS_ROLE, self.ingress_ports.clone())
            .await?;
        self.publish(&self.master_dns, &masters.vip).await?;
        self.publish(&self.ingress_dns, &ingress.vip).await?;

        let vips = Vips {
            masters: masters.vip,
            ingress: ingress.vip,
        };
        *ensured = Some(vips.clone());
        Ok(vips)
    }
}

impl fmt::Display for LoadBalancerDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loadBalancer[{}]", self.master_dns)
    }
}

#[async_trait]
impl MasterDiscovery for LoadBalancerDiscovery {
    async fn control_plane_endpoint(&self) -> Result<String> {
        self.ensure().await?;
        Ok(format!("{}:{}", self.master_dns, API_SERVER_PORT))
    }

    async fn external_endpoints(&self) -> Result<Vec<String>> {
        let vips = self.ensure().await?;
        Ok(vec![vips.masters, vips.ingress])
    }
}

#[async_trait]
impl ProvisionHook for LoadBalancerDiscovery {
    fn name(&self) -> &str {
        "load-balancer"
    }

    async fn before_provision(&self, ctx: &HookContext<'_>, spec: &mut MachineSpec) -> Result<()> {
        let role = if ctx.role.is_master() {
            MASTERS_ROLE
        } else {
            WORKERS_ROLE
        };
        spec.tags.insert(LB_ROLE_TAG.to_string(), role.to_string());
        Ok(())
    }
}
