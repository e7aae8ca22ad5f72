//! Master discovery strategies
//!
//! A strategy answers two questions: where do nodes and operators reach the
//! API server ([`MasterDiscovery::control_plane_endpoint`]), and which
//! externally reachable addresses front the cluster
//! ([`MasterDiscovery::external_endpoints`]).
//!
//! # Strategies
//!
//! - [`ConsulDiscovery`] - health-checked service registry; masters are
//!   balanced client-side through a local proxy
//! - [`LoadBalancerDiscovery`] - L4 load balancers on the virtual network,
//!   published through DNS
//! - [`StaticDiscovery`] - fixed loopback endpoint for local clusters
//! - [`DnsDiscovery`] - DNS round-robin maintained from provisioning hooks
//!
//! Discovery errors are fatal to callers: without an endpoint no member can be
//! added safely.

mod consul;
mod dns;
mod load_balancer;
mod local;

pub use consul::{ConsulDiscovery, LOCAL_PROXY_ENDPOINT};
pub use dns::{DnsClient, DnsDiscovery};
pub use load_balancer::{LoadBalancer, LoadBalancerApi, LoadBalancerDiscovery, LoadBalancerRequest};
pub use local::StaticDiscovery;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DiscoveryConfig, FleetConfig};
use crate::hooks::ProvisionHook;
use crate::{Error, Result};

/// Kubernetes API server port
pub const API_SERVER_PORT: u16 = 6443;

/// Resolves the control-plane endpoint and external master addresses
#[async_trait]
pub trait MasterDiscovery: Send + Sync + fmt::Display {
    /// `host:port` of the API server
    async fn control_plane_endpoint(&self) -> Result<String>;

    /// Externally reachable addresses
    async fn external_endpoints(&self) -> Result<Vec<String>>;
}

/// External services a strategy may need
#[derive(Clone, Default)]
pub struct DiscoveryServices {
    /// Virtual-network load balancer API
    pub load_balancers: Option<Arc<dyn LoadBalancerApi>>,
    /// DNS record API
    pub dns: Option<Arc<dyn DnsClient>>,
    /// HTTP client for registry queries
    pub http: Option<reqwest::Client>,
}

/// A built strategy, plus the hook it contributes to provisioning (if any)
pub struct Discovery {
    /// The strategy
    pub strategy: Arc<dyn MasterDiscovery>,
    /// Provisioning hook to register, for strategies that track machines
    pub hook: Option<Arc<dyn ProvisionHook>>,
}

/// Build the configured strategy.
///
/// Fails when the strategy needs a service that was not supplied.
pub fn from_config(config: &FleetConfig, services: &DiscoveryServices) -> Result<Discovery> {
    match &config.discovery {
        DiscoveryConfig::Consul { address, service } => {
            let http = services.http.clone().unwrap_or_default();
            let service = service.clone().unwrap_or_else(|| config.name.clone());
            Ok(Discovery {
                strategy: Arc::new(ConsulDiscovery::new(http, address, service)),
                hook: None,
            })
        }
        DiscoveryConfig::LoadBalancer {
            master_dns,
            ingress_dns,
            ingress_ports,
        } => {
            let lbs = services
                .load_balancers
                .clone()
                .ok_or_else(|| Error::precondition("loadBalancer discovery needs a load balancer API"))?;
            let dns = services
                .dns
                .clone()
                .ok_or_else(|| Error::precondition("loadBalancer discovery needs a DNS client"))?;
            let strategy = Arc::new(LoadBalancerDiscovery::new(
                &config.name,
                lbs,
                dns,
                master_dns,
                ingress_dns,
                ingress_ports.clone(),
            ));
            Ok(Discovery {
                strategy: strategy.clone(),
                hook: Some(strategy),
            })
        }
        DiscoveryConfig::Static => Ok(Discovery {
            strategy: Arc::new(StaticDiscovery),
            hook: None,
        }),
        DiscoveryConfig::Dns {
            master_dns,
            worker_dns,
        } => {
            let dns = services
                .dns
                .clone()
                .ok_or_else(|| Error::precondition("dns discovery needs a DNS client"))?;
            let strategy = Arc::new(DnsDiscovery::new(dns, master_dns, worker_dns.clone()));
            Ok(Discovery {
                strategy: strategy.clone(),
                hook: Some(strategy),
            })
        }
    }
}

/// Strip any scheme and port from an endpoint, leaving the host
pub fn endpoint_host(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    without_scheme
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(without_scheme)
}
