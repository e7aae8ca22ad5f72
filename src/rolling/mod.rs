//! Rolling restart and upgrade
//!
//! Nodes are maintained strictly one at a time; node *i+1* is not touched
//! until node *i* is [`NodeState::Done`]. Each node goes through:
//!
//! ```text
//! Selected -> HealthSnapshotted -> Draining -> Rebooting -> AwaitingNotReady
//!          -> AwaitingReady -> Uncordoning -> HealthVerified -> Done
//! ```
//!
//! Force mode tolerates drain, reboot-command and not-ready failures. A node
//! that never comes back Ready always fails the run: a node may go down
//! invisibly but must visibly come back. Slow health recovery never fails the
//! run; it is reported.

mod report;

pub use report::{NodeRun, NodeState, RollingReport, SkippedNode};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::config::FleetConfig;
use crate::etcd::EtcdMaintenance;
use crate::health::{Health, HealthSource};
use crate::machine::NodeMachine;
use crate::platform::{NodeInfo, PlatformApi};
use crate::retry::poll_until;
use crate::{Error, Result};

/// Delay before the reboot fires, so the command pod can exit cleanly
pub const REBOOT_DELAY: Duration = Duration::from_secs(5);

/// Tuning for one rolling run
#[derive(Clone, Debug)]
pub struct RollingOptions {
    /// Drain budget, also the not-ready wait
    pub drain_timeout: Duration,
    /// Wait for a node to come back Ready
    pub ready_timeout: Duration,
    /// Budget for the host command that reboots or upgrades a node
    pub command_timeout: Duration,
    /// Continue past drain, reboot and not-ready failures
    pub force: bool,
    /// Node readiness poll interval
    pub poll_interval: Duration,
    /// Health poll interval
    pub health_interval: Duration,
    /// Total health recovery budget per node
    pub health_budget: Duration,
    /// Extra crash-looping pods tolerated relative to baseline
    pub crash_loop_tolerance: u32,
    /// Delay before the reboot fires
    pub reboot_delay: Duration,
}

impl Default for RollingOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(300),
            ready_timeout: Duration::from_secs(900),
            command_timeout: Duration::from_secs(600),
            force: false,
            poll_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(10),
            health_budget: Duration::from_secs(300),
            crash_loop_tolerance: 0,
            reboot_delay: REBOOT_DELAY,
        }
    }
}

impl RollingOptions {
    /// Options from the fleet configuration
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            drain_timeout: config.timeouts.drain(),
            ready_timeout: config.timeouts.ready(),
            force: config.rolling.force,
            health_interval: config.timeouts.health_interval(),
            health_budget: config.timeouts.health_budget(),
            crash_loop_tolerance: config.rolling.crash_loop_tolerance,
            ..Default::default()
        }
    }
}

/// What an upgrade run installs
#[derive(Clone, Debug)]
pub struct UpgradeTarget {
    /// Target Kubernetes version (e.g. "v1.31.2")
    pub version: String,
    /// Host command template; `{version}` is replaced without the leading `v`
    pub command: String,
    /// Nodes younger than this are left alone
    pub min_age: Duration,
}

impl UpgradeTarget {
    /// Target from the fleet configuration
    pub fn from_config(config: &FleetConfig, min_age: Duration) -> Self {
        Self {
            version: config.kubernetes_version.clone(),
            command: config.rolling.upgrade_command.clone(),
            min_age,
        }
    }

    fn script(&self) -> String {
        self.command
            .replace("{version}", self.version.trim_start_matches('v'))
    }

    fn satisfied_by(&self, node: &NodeInfo) -> bool {
        node.kubelet_version
            .as_deref()
            .map(|v| same_version(v, &self.version))
            .unwrap_or(false)
    }
}

fn same_version(a: &str, b: &str) -> bool {
    a.trim_start_matches('v') == b.trim_start_matches('v')
}

/// Host script that reboots after `delay`
pub fn reboot_script(delay: Duration) -> String {
    format!(
        "systemd-run --on-active={}s --timer-property=AccuracySec=1s /bin/systemctl reboot",
        delay.as_secs().max(1)
    )
}

enum Maintenance<'a> {
    Restart,
    Upgrade(&'a UpgradeTarget),
}

/// Drives nodes through maintenance one at a time
pub struct RollingEngine {
    platform: Arc<dyn PlatformApi>,
    health: Arc<dyn HealthSource>,
    etcd: Option<EtcdMaintenance>,
    options: RollingOptions,
}

impl RollingEngine {
    /// Engine over `platform`, comparing health from `health`
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        health: Arc<dyn HealthSource>,
        options: RollingOptions,
    ) -> Self {
        Self {
            platform,
            health,
            etcd: None,
            options,
        }
    }

    /// Move etcd leadership off masters before upgrading them
    pub fn with_etcd(mut self, etcd: EtcdMaintenance) -> Self {
        self.etcd = Some(etcd);
        self
    }

    /// Reboot every non-master node, in list order
    #[instrument(skip_all, fields(force = self.options.force))]
    pub async fn rolling_restart(&self, nodes: &[NodeMachine]) -> Result<RollingReport> {
        let mut report = RollingReport::default();
        let mut selected = Vec::new();
        for nm in nodes {
            match &nm.node {
                None => report.skip(&nm.name, "never joined"),
                Some(node) if node.is_master => report.skip(&node.name, "master"),
                Some(node) => selected.push(node),
            }
        }

        self.run(&selected, &Maintenance::Restart, &mut report).await?;
        Ok(report)
    }

    /// Upgrade nodes older than the target's minimum age, masters first
    #[instrument(skip_all, fields(version = %target.version, force = self.options.force))]
    pub async fn rolling_upgrade(
        &self,
        nodes: &[NodeMachine],
        target: &UpgradeTarget,
    ) -> Result<RollingReport> {
        let now = Utc::now();
        let mut report = RollingReport::default();
        let mut masters = Vec::new();
        let mut workers = Vec::new();

        for nm in nodes {
            let Some(node) = &nm.node else {
                report.skip(&nm.name, "never joined");
                continue;
            };
            if target.satisfied_by(node) {
                report.skip(&node.name, format!("already at {}", target.version));
                continue;
            }
            if let Some(age) = node_age(nm, now) {
                if age < target.min_age {
                    report.skip(&node.name, format!("younger than {:?}", target.min_age));
                    continue;
                }
            }
            if node.is_master {
                masters.push(node);
            } else {
                workers.push(node);
            }
        }

        masters.extend(workers);
        self.run(&masters, &Maintenance::Upgrade(target), &mut report)
            .await?;
        Ok(report)
    }

    async fn run(
        &self,
        nodes: &[&NodeInfo],
        maintenance: &Maintenance<'_>,
        report: &mut RollingReport,
    ) -> Result<()> {
        if nodes.is_empty() {
            info!("no nodes need maintenance");
            return Ok(());
        }
        let baseline = self.health.health().await?;
        info!(nodes = nodes.len(), %baseline, "captured health baseline");

        for node in nodes {
            let mut run = NodeRun::new(&node.name);
            let result = self
                .maintain(node, maintenance, &baseline, &mut run, report)
                .await;
            report.runs.push(run);
            result?;
        }
        info!(%report, "rolling run complete");
        Ok(())
    }

    fn tolerate(
        &self,
        node: &str,
        state: NodeState,
        error: Error,
        report: &mut RollingReport,
    ) -> Result<()> {
        if !self.options.force {
            return Err(error);
        }
        warn!(node = %node, %state, error = %error, "continuing in force mode");
        report.forced.push(format!("{node} {state}: {error}"));
        Ok(())
    }

    #[instrument(skip_all, fields(node = %node.name))]
    async fn maintain(
        &self,
        node: &NodeInfo,
        maintenance: &Maintenance<'_>,
        baseline: &Health,
        run: &mut NodeRun,
        report: &mut RollingReport,
    ) -> Result<()> {
        let name = node.name.as_str();
        run.states.push(NodeState::HealthSnapshotted);

        if let (Maintenance::Upgrade(_), Some(etcd)) = (maintenance, &self.etcd) {
            if node.is_master {
                if let Err(e) = etcd.step_down(name).await {
                    self.tolerate(name, NodeState::Selected, e, report)?;
                }
            }
        }

        run.states.push(NodeState::Draining);
        info!("draining");
        if let Err(e) = self.platform.drain(name, self.options.drain_timeout).await {
            self.tolerate(name, NodeState::Draining, e, report)?;
        }

        run.states.push(NodeState::Rebooting);
        let script = match maintenance {
            Maintenance::Restart => reboot_script(self.options.reboot_delay),
            Maintenance::Upgrade(target) => format!(
                "{} && {}",
                target.script(),
                reboot_script(self.options.reboot_delay)
            ),
        };
        debug!(%script, "issuing host command");
        if let Err(e) = self
            .platform
            .run_on_node(name, &script, self.options.command_timeout)
            .await
        {
            self.tolerate(name, NodeState::Rebooting, e, report)?;
        }

        run.states.push(NodeState::AwaitingNotReady);
        let platform = self.platform.as_ref();
        let not_ready = poll_until(
            self.options.drain_timeout,
            self.options.poll_interval,
            format!("node {name} to go down"),
            || async move {
                let node = platform.get_node(name).await;
                node.map(|n| n.map(|n| !n.ready).unwrap_or(true))
            },
        )
        .await;
        if let Err(e) = not_ready {
            self.tolerate(name, NodeState::AwaitingNotReady, e, report)?;
        }

        run.states.push(NodeState::AwaitingReady);
        poll_until(
            self.options.ready_timeout,
            self.options.poll_interval,
            format!("node {name} to become ready"),
            || async move {
                let node = platform.get_node(name).await;
                node.map(|n| n.map(|n| n.ready).unwrap_or(false))
            },
        )
        .await
        .map_err(|e| Error::NodeNotReady {
            node: name.to_string(),
            message: e.to_string(),
        })?;

        run.states.push(NodeState::Uncordoning);
        if let Err(e) = self.platform.uncordon(name).await {
            self.tolerate(name, NodeState::Uncordoning, e, report)?;
        }

        run.states.push(NodeState::HealthVerified);
        if let Err(e) = self.wait_for_health(baseline).await {
            warn!(error = %e, "cluster health did not recover within budget, moving on");
            report.health_warnings.push(format!("after {name}: {e}"));
        }

        run.states.push(NodeState::Done);
        info!("node done");
        Ok(())
    }

    async fn wait_for_health(&self, baseline: &Health) -> Result<()> {
        let health = self.health.as_ref();
        let tolerance = self.options.crash_loop_tolerance;
        poll_until(
            self.options.health_budget,
            self.options.health_interval,
            "cluster health to recover",
            || async move {
                health.health().await.map(|current| {
                    let degraded = current.is_degraded_compared_to(baseline, tolerance);
                    if degraded {
                        debug!(%current, %baseline, "cluster degraded");
                    }
                    !degraded
                })
            },
        )
        .await
    }
}

/// Machine creation time, falling back to the node's
fn node_age(nm: &NodeMachine, now: DateTime<Utc>) -> Option<Duration> {
    nm.created
        .or_else(|| nm.node.as_ref().and_then(|n| n.created))
        .and_then(|created| (now - created).to_std().ok())
}
