//! Desired-vs-actual convergence for a cluster's machines
//!
//! [`Cluster::reconcile`] resolves the control-plane endpoint (fatal on
//! failure) and then runs in three phases:
//!
//! 1. **Control plane**: if the API server does not answer and no master
//!    machine exists, create exactly one primary master and wait for the
//!    control plane to come up. Failure here is fatal.
//! 2. **Masters**: inventory the masters and every worker pool and enforce
//!    the orphan guard, then join missing secondary masters one at a time.
//!    Concurrent etcd joins race on membership changes, so this phase never
//!    fans out.
//! 3. **Pools**: scale all pools in parallel under one concurrency limit.
//!    Scale-down removes the oldest members.
//!
//! The orphan guard also runs before a primary master is created, so a
//! refused run never clones anything.
//!
//! Failures on individual machines are logged and recorded in the returned
//! [`ReconcileSummary`]; siblings carry on.

mod plan;
mod summary;

pub use plan::{plan, Action, Inventory};
pub use summary::{ReconcileSummary, Skipped};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{BootstrapConfigBuilder, BootstrapContext, BootstrapRole};
use crate::config::{FleetConfig, MachineTemplate};
use crate::discovery::MasterDiscovery;
use crate::hooks::{CompositeHook, HookContext, ProvisionHook};
use crate::machine::{
    lineage_attributes, sort_oldest_first, Machine, MachineProvider, MachineSpec, NodeMachine,
};
use crate::names::{in_pool, machine_name};
use crate::platform::{NodeInfo, PlatformApi};
use crate::retry::poll_until;
use crate::{Error, Result};

/// Default interval between control-plane reachability checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A cluster and everything needed to converge it
#[derive(Clone)]
pub struct Cluster {
    config: Arc<FleetConfig>,
    provider: Arc<dyn MachineProvider>,
    platform: Arc<dyn PlatformApi>,
    discovery: Arc<dyn MasterDiscovery>,
    bootstrap: Arc<dyn BootstrapConfigBuilder>,
    hooks: CompositeHook,
    primary_lock: Arc<Mutex<()>>,
    poll_interval: Duration,
}

/// Builder for [`Cluster`]
pub struct ClusterBuilder {
    config: FleetConfig,
    provider: Arc<dyn MachineProvider>,
    platform: Arc<dyn PlatformApi>,
    discovery: Arc<dyn MasterDiscovery>,
    bootstrap: Arc<dyn BootstrapConfigBuilder>,
    hooks: CompositeHook,
    poll_interval: Duration,
}

impl ClusterBuilder {
    /// Append a provisioning hook
    pub fn hook(mut self, hook: Arc<dyn ProvisionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Override the control-plane poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the cluster
    pub fn build(self) -> Cluster {
        Cluster {
            config: Arc::new(self.config),
            provider: self.provider,
            platform: self.platform,
            discovery: self.discovery,
            bootstrap: self.bootstrap,
            hooks: self.hooks,
            primary_lock: Arc::new(Mutex::new(())),
            poll_interval: self.poll_interval,
        }
    }
}

/// How a machine is being retired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Retirement {
    /// Pool shrink: drain first, graceful guest shutdown
    ScaleDown,
    /// Whole cluster going away: no drain, hard power off
    Teardown,
}

/// Pool inventories taken before anything is mutated
type PoolInventories = Vec<(String, MachineTemplate, Inventory)>;

impl Cluster {
    /// Start building a cluster from its collaborators
    pub fn builder(
        config: FleetConfig,
        provider: Arc<dyn MachineProvider>,
        platform: Arc<dyn PlatformApi>,
        discovery: Arc<dyn MasterDiscovery>,
        bootstrap: Arc<dyn BootstrapConfigBuilder>,
    ) -> ClusterBuilder {
        ClusterBuilder {
            config,
            provider,
            platform,
            discovery,
            bootstrap,
            hooks: CompositeHook::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Configuration this cluster converges to
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Platform API the cluster talks to
    pub fn platform(&self) -> Arc<dyn PlatformApi> {
        self.platform.clone()
    }

    /// Converge machines to the configured topology.
    ///
    /// Idempotent: a second run with no external change does nothing.
    #[instrument(skip(self), fields(cluster = %self.config.name, discovery = %self.discovery))]
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut endpoint = self.discovery.control_plane_endpoint().await?;
        debug!(%endpoint, "resolved control-plane endpoint");

        if self.ensure_control_plane(&endpoint, &mut summary).await? {
            // the new primary may have just published the endpoint
            endpoint = self.discovery.control_plane_endpoint().await?;
            debug!(%endpoint, "re-resolved control-plane endpoint");
        }

        let nodes = self.platform.list_nodes().await?;
        let inventories = self.preflight(&nodes).await?;

        self.reconcile_masters(&endpoint, &mut summary).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.provisioning.concurrency));
        let endpoint = endpoint.as_str();
        let results = join_all(inventories.into_iter().map(|(pool, template, inventory)| {
            self.scale_pool(pool, template, inventory, endpoint, semaphore.clone())
        }))
        .await;
        for pool_summary in results {
            summary.merge(pool_summary);
        }

        summary.log();
        Ok(summary)
    }

    /// Terminate every machine: pools in parallel, then masters one by one.
    /// Nothing is drained.
    #[instrument(skip(self), fields(cluster = %self.config.name))]
    pub async fn teardown(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let nodes = self.platform.list_nodes().await.unwrap_or_else(|e| {
            warn!(error = %e, "cannot list nodes, tearing down machines only");
            Vec::new()
        });

        let semaphore = Arc::new(Semaphore::new(self.config.provisioning.concurrency));
        let mut tasks = JoinSet::new();
        for pool in self.config.pools.keys() {
            let inventory = self.inventory(&self.config.pool_prefix(pool), &nodes).await?;
            let role = BootstrapRole::Worker { pool: pool.clone() };
            for member in inventory.members.into_iter().chain(inventory.orphans) {
                let this = self.clone();
                let role = role.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let name = member.name.clone();
                    (name, this.retire(member, &role, Retirement::Teardown).await)
                });
            }
        }
        collect_terminations(&mut tasks, &mut summary).await;

        let masters = self.inventory(&self.config.master_prefix(), &nodes).await?;
        for member in masters.members.into_iter().chain(masters.orphans) {
            let name = member.name.clone();
            match self
                .retire(member, &BootstrapRole::SecondaryMaster, Retirement::Teardown)
                .await
            {
                Ok(()) => summary.terminated.push(name),
                Err(e) => summary.skip(name, e),
            }
        }

        summary.log();
        Ok(summary)
    }

    /// Every joined node paired with its machine, oldest first
    pub async fn node_machines(&self) -> Result<Vec<NodeMachine>> {
        let nodes = self.platform.list_nodes().await?;
        let prefix = format!("{}-", self.config.name);
        let mut machines = self.provider.machines_by_prefix(&prefix).await?;

        let mut paired = Vec::with_capacity(nodes.len());
        for node in nodes {
            let machine = machines.remove(&node.name);
            paired.push(NodeMachine::new(Some(node), machine).await);
        }
        sort_oldest_first(&mut paired);
        Ok(paired)
    }

    // =========================================================================
    // Control plane
    // =========================================================================

    /// Make sure an API server answers; true when a primary was created
    async fn ensure_control_plane(
        &self,
        endpoint: &str,
        summary: &mut ReconcileSummary,
    ) -> Result<bool> {
        if self.platform.ping().await {
            return Ok(false);
        }

        // one primary-master attempt at a time; latecomers find it done
        let _guard = self.primary_lock.lock().await;
        if self.platform.ping().await {
            return Ok(false);
        }

        let masters = self.master_machines().await?;
        if !masters.is_empty() {
            info!(
                masters = masters.len(),
                "master machines exist but control plane is not answering, waiting"
            );
            self.wait_for_control_plane().await?;
            return Ok(false);
        }

        // without a control plane nothing has joined
        self.preflight(&[]).await?;

        let name = machine_name(&self.config.master_prefix());
        info!(machine = %name, "no control plane, creating primary master");
        self.provision(
            &BootstrapRole::PrimaryMaster,
            &name,
            &self.config.masters,
            endpoint,
        )
        .await
        .map_err(|e| Error::provider(format!("primary master {name}: {e}")))?;
        summary.created.push(name);

        self.wait_for_control_plane().await?;
        Ok(true)
    }

    async fn wait_for_control_plane(&self) -> Result<()> {
        let platform = self.platform.as_ref();
        poll_until(
            self.config.timeouts.control_plane(),
            self.poll_interval,
            "control plane to answer",
            || async move { Ok(platform.ping().await) },
        )
        .await?;
        info!("control plane reachable");
        Ok(())
    }

    async fn master_machines(&self) -> Result<HashMap<String, Arc<dyn Machine>>> {
        let prefix = self.config.master_prefix();
        let mut machines = self.provider.machines_by_prefix(&prefix).await?;
        machines.retain(|name, _| in_pool(&prefix, name));
        Ok(machines)
    }

    async fn reconcile_masters(&self, endpoint: &str, summary: &mut ReconcileSummary) -> Result<()> {
        let existing = self.master_machines().await?.len();
        let desired = self.config.masters.count as usize;

        if existing > desired {
            warn!(
                existing,
                desired, "more masters than desired; master removal is operator-driven"
            );
            return Ok(());
        }

        for _ in existing..desired {
            let name = machine_name(&self.config.master_prefix());
            info!(machine = %name, "joining secondary master");
            match self
                .provision(
                    &BootstrapRole::SecondaryMaster,
                    &name,
                    &self.config.masters,
                    endpoint,
                )
                .await
            {
                Ok(_) => summary.created.push(name),
                Err(e) => {
                    warn!(machine = %name, error = %e, "secondary master failed, not joining more");
                    summary.skip(name, e);
                    break;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Pools
    // =========================================================================

    async fn inventory(&self, prefix: &str, nodes: &[NodeInfo]) -> Result<Inventory> {
        let machines = self.provider.machines_by_prefix(prefix).await?;
        let inventory = Inventory::collect(prefix, machines, nodes).await;
        for orphan in &inventory.orphans {
            error!(
                machine = %orphan.name,
                "machine exists but never joined the cluster; excluded from pool count"
            );
        }
        Ok(inventory)
    }

    /// Inventory masters and every pool, refusing to go on when any of them
    /// holds more never-joined machines than allowed
    async fn preflight(&self, nodes: &[NodeInfo]) -> Result<PoolInventories> {
        let masters = self.inventory(&self.config.master_prefix(), nodes).await?;
        self.check_orphans("master", &masters)?;

        let mut inventories = Vec::with_capacity(self.config.pools.len());
        for (pool, template) in &self.config.pools {
            let inventory = self.inventory(&self.config.pool_prefix(pool), nodes).await?;
            self.check_orphans(pool, &inventory)?;
            inventories.push((pool.clone(), template.clone(), inventory));
        }
        Ok(inventories)
    }

    fn check_orphans(&self, pool: &str, inventory: &Inventory) -> Result<()> {
        let max = self.config.provisioning.max_orphans;
        if inventory.orphans.len() > max {
            return Err(Error::precondition(format!(
                "pool {pool} has {} machines that never joined (limit {max}); refusing to provision more",
                inventory.orphans.len()
            )));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(pool = %pool))]
    async fn scale_pool(
        &self,
        pool: String,
        template: MachineTemplate,
        inventory: Inventory,
        endpoint: &str,
        semaphore: Arc<Semaphore>,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let role = BootstrapRole::Worker { pool: pool.clone() };
        let prefix = self.config.pool_prefix(&pool);
        let desired = template.count as usize;
        let current = inventory.current();

        match plan(desired, inventory.members) {
            Action::Steady => debug!(current, "pool at desired size"),
            Action::ScaleUp(count) => {
                info!(current, desired, "scaling up");
                let template = Arc::new(template);
                let mut tasks = JoinSet::new();
                for i in 0..count {
                    if i > 0 {
                        tokio::time::sleep(self.config.provisioning.stagger()).await;
                    }
                    let name = machine_name(&prefix);
                    let this = self.clone();
                    let role = role.clone();
                    let template = template.clone();
                    let endpoint = endpoint.to_string();
                    let semaphore = semaphore.clone();
                    tasks.spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        let result = this
                            .provision(&role, &name, &template, &endpoint)
                            .await
                            .map(|_| ());
                        (name, result)
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => summary.created.push(name),
                        Ok((name, Err(e))) => {
                            warn!(machine = %name, error = %e, "provisioning failed");
                            summary.skip(name, e);
                        }
                        Err(e) => warn!(error = %e, "provisioning task panicked"),
                    }
                }
            }
            Action::ScaleDown(victims) => {
                info!(current, desired, victims = victims.len(), "scaling down, oldest first");
                let mut tasks = JoinSet::new();
                for member in victims {
                    let this = self.clone();
                    let role = role.clone();
                    let semaphore = semaphore.clone();
                    tasks.spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        let name = member.name.clone();
                        (name, this.retire(member, &role, Retirement::ScaleDown).await)
                    });
                }
                collect_terminations(&mut tasks, &mut summary).await;
            }
        }
        summary
    }

    // =========================================================================
    // Machine lifecycle
    // =========================================================================

    async fn provision(
        &self,
        role: &BootstrapRole,
        name: &str,
        template: &MachineTemplate,
        endpoint: &str,
    ) -> Result<Arc<dyn Machine>> {
        let ctx = HookContext {
            cluster: &self.config.name,
            role,
            address: None,
        };
        let mut spec = MachineSpec::from_template(name, template);
        self.hooks.before_provision(&ctx, &mut spec).await?;

        let bootstrap = self
            .bootstrap
            .build(&BootstrapContext {
                role,
                hostname: name,
                control_plane_endpoint: endpoint,
            })
            .await?;
        let machine = self.provider.clone_machine(&spec, &bootstrap).await?;
        if let Err(e) = machine
            .set_attributes(lineage_attributes(&spec.template, Utc::now()))
            .await
        {
            warn!(machine = %name, error = %e, "failed to record creation attributes");
        }

        let ip = machine.get_ip(self.config.timeouts.ip()).await?;
        info!(machine = %name, %ip, %role, "machine running");

        // registration is best-effort once the machine exists
        let ctx = HookContext {
            address: Some(&ip),
            ..ctx
        };
        if let Err(e) = self.hooks.after_provision(&ctx, machine.as_ref()).await {
            warn!(machine = %name, error = %e, "after-provision hooks failed");
        }
        Ok(machine)
    }

    /// Retire one member: hooks, drain, node delete, hooks, power down,
    /// destroy.
    ///
    /// Every step but the last is best-effort; only failing to destroy the
    /// instance fails.
    async fn retire(
        &self,
        member: NodeMachine,
        role: &BootstrapRole,
        mode: Retirement,
    ) -> Result<()> {
        let ctx = HookContext {
            cluster: &self.config.name,
            role,
            address: None,
        };
        let name = member.name.as_str();

        if let Some(machine) = &member.machine {
            if let Err(e) = self.hooks.before_terminate(&ctx, machine.as_ref()).await {
                warn!(machine = %name, error = %e, "before-terminate hooks failed, continuing");
            }
        }

        if member.node.is_some() {
            if mode == Retirement::ScaleDown {
                if let Err(e) = self
                    .platform
                    .drain(name, self.config.timeouts.drain())
                    .await
                {
                    warn!(node = %name, error = %e, "drain failed, continuing");
                }
            }
            if let Err(e) = self.platform.delete_node(name).await {
                warn!(node = %name, error = %e, "failed to delete node");
            }
        }

        let Some(machine) = &member.machine else {
            info!(node = %name, "removed node without a tracked machine");
            return Ok(());
        };
        if let Err(e) = self.hooks.after_terminate(&ctx, machine.as_ref()).await {
            warn!(machine = %name, error = %e, "after-terminate hooks failed");
        }
        power_down(machine.as_ref(), mode).await;
        machine.terminate().await?;
        info!(machine = %name, "terminated");
        Ok(())
    }
}

/// Stop the instance before it is destroyed; a failed graceful shutdown
/// falls back to a hard power off
async fn power_down(machine: &dyn Machine, mode: Retirement) {
    let name = machine.name();
    if mode == Retirement::ScaleDown {
        match machine.shutdown().await {
            Ok(()) => return,
            Err(e) => warn!(machine = %name, error = %e, "graceful shutdown failed, powering off"),
        }
    }
    if let Err(e) = machine.power_off().await {
        warn!(machine = %name, error = %e, "power off failed, destroying anyway");
    }
}

async fn collect_terminations(
    tasks: &mut JoinSet<(String, Result<()>)>,
    summary: &mut ReconcileSummary,
) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => summary.terminated.push(name),
            Ok((name, Err(e))) => {
                warn!(machine = %name, error = %e, "termination failed");
                summary.skip(name, e);
            }
            Err(e) => warn!(error = %e, "termination task panicked"),
        }
    }
}
