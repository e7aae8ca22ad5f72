//! DNS round-robin discovery
//!
//! Every master's address is appended to one name as it is provisioned and
//! removed before it is destroyed; workers optionally share a wildcard
//! ingress name the same way. DNS trouble never blocks provisioning: failures
//! are logged and the control-plane endpoint falls back to a bare master IP.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use super::{MasterDiscovery, API_SERVER_PORT};
use crate::hooks::{HookContext, ProvisionHook};
use crate::machine::Machine;
use crate::Result;

/// Record-level DNS operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Add `ip` to the A records of `name`, keeping existing ones
    async fn append(&self, name: &str, ip: &str) -> Result<()>;

    /// Remove `ip` from the A records of `name`
    async fn remove(&self, name: &str, ip: &str) -> Result<()>;

    /// Point `name` at exactly `ip`
    async fn upsert(&self, name: &str, ip: &str) -> Result<()>;
}

#[derive(Default)]
struct Registrations {
    registered: usize,
    fallback_ip: Option<String>,
}

/// Round-robin A records maintained from provisioning hooks
pub struct DnsDiscovery {
    dns: Arc<dyn DnsClient>,
    master_dns: String,
    worker_dns: Option<String>,
    state: Mutex<Registrations>,
}

impl DnsDiscovery {
    /// Maintain `master_dns` (and `worker_dns` when set)
    pub fn new(dns: Arc<dyn DnsClient>, master_dns: &str, worker_dns: Option<String>) -> Self {
        Self {
            dns,
            master_dns: master_dns.to_string(),
            worker_dns,
            state: Mutex::new(Registrations::default()),
        }
    }

    fn record_for(&self, ctx: &HookContext<'_>) -> Option<&str> {
        if ctx.role.is_master() {
            Some(&self.master_dns)
        } else {
            self.worker_dns.as_deref()
        }
    }

    fn note_master(&self, ip: &str, ok: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if ok {
            state.registered += 1;
        } else if state.fallback_ip.is_none() {
            state.fallback_ip = Some(ip.to_string());
        }
    }
}

impl fmt::Display for DnsDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns[{}]", self.master_dns)
    }
}

#[async_trait]
impl MasterDiscovery for DnsDiscovery {
    async fn control_plane_endpoint(&self) -> Result<String> {
        let fallback = self
            .state
            .lock()
            .ok()
            .filter(|s| s.registered == 0)
            .and_then(|s| s.fallback_ip.clone());
        let host = fallback.unwrap_or_else(|| self.master_dns.clone());
        Ok(format!("{host}:{API_SERVER_PORT}"))
    }

    async fn external_endpoints(&self) -> Result<Vec<String>> {
        let mut endpoints = vec![self.master_dns.clone()];
        endpoints.extend(self.worker_dns.clone());
        Ok(endpoints)
    }
}

#[async_trait]
impl ProvisionHook for DnsDiscovery {
    fn name(&self) -> &str {
        "dns"
    }

    async fn after_provision(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        let Some(record) = self.record_for(ctx) else {
            return Ok(());
        };
        let Some(ip) = ctx.address.map(str::to_string).or_else(|| machine.ip()) else {
            warn!(machine = %machine.name(), "no address to register in DNS");
            return Ok(());
        };

        let result = self.dns.append(record, &ip).await;
        match &result {
            Ok(()) => info!(record, %ip, machine = %machine.name(), "registered DNS record"),
            Err(e) => warn!(record, %ip, error = %e, "DNS registration failed, continuing"),
        }
        if ctx.role.is_master() {
            self.note_master(&ip, result.is_ok());
        }
        Ok(())
    }

    async fn before_terminate(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        let (Some(record), Some(ip)) = (self.record_for(ctx), machine.ip()) else {
            return Ok(());
        };
        if let Err(e) = self.dns.remove(record, &ip).await {
            warn!(record, %ip, error = %e, "failed to remove DNS record");
        }
        Ok(())
    }
}
