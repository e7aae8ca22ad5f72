//! Provisioning hooks
//!
//! Hooks run around machine creation and destruction: DNS registration,
//! network tags, etcd member removal. A [`CompositeHook`] runs an ordered list
//! of them:
//!
//! - `before_*` stop at the first error. A failed precondition means the
//!   operation should not happen.
//! - `after_*` run every hook and return the last error. Partial
//!   registration/cleanup beats none.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bootstrap::BootstrapRole;
use crate::machine::{Machine, MachineSpec};
use crate::Result;

/// What a hook is being invoked for
#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    /// Cluster name
    pub cluster: &'a str,
    /// Role of the machine being created or destroyed
    pub role: &'a BootstrapRole,
    /// Address resolved while provisioning; `None` before the clone and on
    /// termination
    pub address: Option<&'a str>,
}

/// Callbacks around machine provisioning and termination.
///
/// Every method defaults to a no-op so hooks implement only what they need.
#[async_trait]
pub trait ProvisionHook: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Before cloning; may add tags or adjust the spec
    async fn before_provision(&self, _ctx: &HookContext<'_>, _spec: &mut MachineSpec) -> Result<()> {
        Ok(())
    }

    /// After the machine exists and has an address
    async fn after_provision(&self, _ctx: &HookContext<'_>, _machine: &dyn Machine) -> Result<()> {
        Ok(())
    }

    /// Before the machine is drained and destroyed
    async fn before_terminate(&self, _ctx: &HookContext<'_>, _machine: &dyn Machine) -> Result<()> {
        Ok(())
    }

    /// After the node record is gone, before the instance is destroyed
    async fn after_terminate(&self, _ctx: &HookContext<'_>, _machine: &dyn Machine) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of hooks run as one
#[derive(Clone, Default)]
pub struct CompositeHook {
    hooks: Vec<Arc<dyn ProvisionHook>>,
}

impl CompositeHook {
    /// Empty composite
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook; hooks run in insertion order
    pub fn with(mut self, hook: Arc<dyn ProvisionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Append a hook in place
    pub fn push(&mut self, hook: Arc<dyn ProvisionHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl ProvisionHook for CompositeHook {
    fn name(&self) -> &str {
        "composite"
    }

    async fn before_provision(&self, ctx: &HookContext<'_>, spec: &mut MachineSpec) -> Result<()> {
        for hook in &self.hooks {
            debug!(hook = hook.name(), machine = %spec.name, "before provision");
            hook.before_provision(ctx, spec).await?;
        }
        Ok(())
    }

    async fn after_provision(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        let mut last = Ok(());
        for hook in &self.hooks {
            if let Err(e) = hook.after_provision(ctx, machine).await {
                warn!(hook = hook.name(), machine = %machine.name(), error = %e, "after-provision hook failed");
                last = Err(e);
            }
        }
        last
    }

    async fn before_terminate(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        for hook in &self.hooks {
            debug!(hook = hook.name(), machine = %machine.name(), "before terminate");
            hook.before_terminate(ctx, machine).await?;
        }
        Ok(())
    }

    async fn after_terminate(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        let mut last = Ok(());
        for hook in &self.hooks {
            if let Err(e) = hook.after_terminate(ctx, machine).await {
                warn!(hook = hook.name(), machine = %machine.name(), error = %e, "after-terminate hook failed");
                last = Err(e);
            }
        }
        last
    }
}
