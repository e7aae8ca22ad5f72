//! Service-registry discovery backed by Consul health checks

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::MasterDiscovery;
use crate::Result;

/// Local proxy every node runs in front of the registered masters
pub const LOCAL_PROXY_ENDPOINT: &str = "localhost:8443";

/// Masters found through the registry's health API
pub struct ConsulDiscovery {
    http: reqwest::Client,
    address: String,
    service: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: CatalogNode,
    service: CatalogService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogNode {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

impl ConsulDiscovery {
    /// Query `address` (registry base URL) for instances of `service`
    pub fn new(http: reqwest::Client, address: &str, service: impl Into<String>) -> Self {
        Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            service: service.into(),
        }
    }

    async fn entries(&self) -> Result<Vec<ServiceEntry>> {
        let url = format!("{}/v1/health/service/{}", self.address, self.service);
        let entries = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries)
    }
}

/// Addresses of instances whose every check is passing
fn healthy_addresses(entries: Vec<ServiceEntry>) -> Vec<String> {
    entries
        .into_iter()
        .filter(|e| e.checks.iter().all(|c| c.status == "passing"))
        .map(|e| {
            if e.service.address.is_empty() {
                e.node.address
            } else {
                e.service.address
            }
        })
        .collect()
}

impl fmt::Display for ConsulDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consul[{}/{}]", self.address, self.service)
    }
}

#[async_trait]
impl MasterDiscovery for ConsulDiscovery {
    async fn control_plane_endpoint(&self) -> Result<String> {
        Ok(LOCAL_PROXY_ENDPOINT.to_string())
    }

    async fn external_endpoints(&self) -> Result<Vec<String>> {
        let entries = self.entries().await?;
        let total = entries.len();
        let healthy = healthy_addresses(entries);
        if healthy.is_empty() {
            warn!(service = %self.service, total, "no passing instances registered");
        } else {
            debug!(service = %self.service, total, healthy = healthy.len(), "queried registry");
        }
        Ok(healthy)
    }
}
