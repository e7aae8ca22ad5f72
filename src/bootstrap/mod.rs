//! Instance bootstrap payloads
//!
//! Every new machine boots with an init payload (cloud-init user data) that
//! carries its role-specific join procedure. The payload contents (join
//! tokens, certificates, registry registration) come from the surrounding
//! system; the orchestrator only selects the variant:
//!
//! - [`BootstrapRole::PrimaryMaster`] initialises a fresh control plane
//! - [`BootstrapRole::SecondaryMaster`] joins an existing control plane and etcd
//! - [`BootstrapRole::Worker`] joins as a worker in a named pool
//!
//! Joining roles need the control-plane endpoint, which some discovery
//! strategies only know at runtime; it arrives in [`BootstrapContext`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::{Error, Result};

/// Which join path a new machine takes
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BootstrapRole {
    /// First master of a new cluster
    PrimaryMaster,
    /// Additional master joining an existing control plane
    SecondaryMaster,
    /// Worker in a named pool
    Worker {
        /// Pool name
        pool: String,
    },
}

impl BootstrapRole {
    /// True for either master variant
    pub fn is_master(&self) -> bool {
        !matches!(self, BootstrapRole::Worker { .. })
    }
}

impl fmt::Display for BootstrapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapRole::PrimaryMaster => f.write_str("primary-master"),
            BootstrapRole::SecondaryMaster => f.write_str("secondary-master"),
            BootstrapRole::Worker { pool } => write!(f, "worker/{pool}"),
        }
    }
}

/// Opaque instance-init payload handed to the provider on clone
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BootstrapConfig {
    /// User data, passed through to the instance unchanged
    pub user_data: String,
}

/// What a payload is built for
#[derive(Clone, Copy, Debug)]
pub struct BootstrapContext<'a> {
    /// Join path
    pub role: &'a BootstrapRole,
    /// Machine name, also the node hostname
    pub hostname: &'a str,
    /// Resolved control-plane endpoint (`host:port`)
    pub control_plane_endpoint: &'a str,
}

/// Produces the bootstrap payload for a new machine
#[async_trait]
pub trait BootstrapConfigBuilder: Send + Sync {
    /// Build the payload for the machine described by `ctx`
    async fn build(&self, ctx: &BootstrapContext<'_>) -> Result<BootstrapConfig>;
}

/// Placeholder replaced with the control-plane endpoint in commands
pub const ENDPOINT_PLACEHOLDER: &str = "{endpoint}";

/// Renders `#cloud-config` documents from per-role shell commands.
///
/// The commands themselves (kubeadm init/join with tokens, registry
/// registration) are supplied by the caller; this builder sets the hostname,
/// orders the commands and substitutes [`ENDPOINT_PLACEHOLDER`].
#[derive(Clone, Debug, Default)]
pub struct CloudConfigBuilder {
    common: Vec<String>,
    primary: Vec<String>,
    secondary: Vec<String>,
    workers: BTreeMap<String, Vec<String>>,
    default_worker: Vec<String>,
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    hostname: &'a str,
    fqdn: &'a str,
    runcmd: Vec<String>,
}

impl CloudConfigBuilder {
    /// Commands run on every machine before the role commands
    pub fn with_common(mut self, commands: Vec<String>) -> Self {
        self.common = commands;
        self
    }

    /// Commands for the primary master
    pub fn with_primary(mut self, commands: Vec<String>) -> Self {
        self.primary = commands;
        self
    }

    /// Commands for secondary masters
    pub fn with_secondary(mut self, commands: Vec<String>) -> Self {
        self.secondary = commands;
        self
    }

    /// Commands for workers in any pool without its own entry
    pub fn with_worker(mut self, commands: Vec<String>) -> Self {
        self.default_worker = commands;
        self
    }

    /// Commands for workers in one pool
    pub fn with_pool(mut self, pool: impl Into<String>, commands: Vec<String>) -> Self {
        self.workers.insert(pool.into(), commands);
        self
    }

    fn role_commands(&self, role: &BootstrapRole) -> &[String] {
        match role {
            BootstrapRole::PrimaryMaster => &self.primary,
            BootstrapRole::SecondaryMaster => &self.secondary,
            BootstrapRole::Worker { pool } => self
                .workers
                .get(pool)
                .map(Vec::as_slice)
                .unwrap_or(&self.default_worker),
        }
    }

    /// Render synchronously
    pub fn render(&self, ctx: &BootstrapContext<'_>) -> Result<BootstrapConfig> {
        let role_commands = self.role_commands(ctx.role);
        if role_commands.is_empty() {
            return Err(Error::bootstrap(format!(
                "no join commands for role {}",
                ctx.role
            )));
        }
        if ctx.control_plane_endpoint.is_empty() && *ctx.role != BootstrapRole::PrimaryMaster {
            return Err(Error::bootstrap(format!(
                "{} cannot join without a control-plane endpoint",
                ctx.hostname
            )));
        }

        let doc = CloudConfig {
            hostname: ctx.hostname,
            fqdn: ctx.hostname,
            runcmd: self
                .common
                .iter()
                .chain(role_commands)
                .map(|c| c.replace(ENDPOINT_PLACEHOLDER, ctx.control_plane_endpoint))
                .collect(),
        };
        let body = serde_yaml::to_string(&doc)?;
        Ok(BootstrapConfig {
            user_data: format!("#cloud-config\n{body}"),
        })
    }
}

#[async_trait]
impl BootstrapConfigBuilder for CloudConfigBuilder {
    async fn build(&self, ctx: &BootstrapContext<'_>) -> Result<BootstrapConfig> {
        self.render(ctx)
    }
}
