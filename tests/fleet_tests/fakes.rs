//! In-memory provider and platform
//!
//! Cloning a machine in [`FakeProvider`] immediately registers a Ready node of
//! the same name in [`FakePlatform`], as if kubelet had joined. The platform's
//! API server answers once any master node exists.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleet::bootstrap::{BootstrapConfig, BootstrapConfigBuilder, BootstrapContext};
use fleet::health::{Health, HealthSource};
use fleet::machine::{lineage_attributes, Machine, MachineProvider, MachineSpec};
use fleet::platform::{NodeInfo, PlatformApi};
use fleet::{Error, Result};

// =============================================================================
// Machines
// =============================================================================

#[derive(Debug)]
pub struct FakeMachine {
    name: String,
    attributes: Mutex<BTreeMap<String, String>>,
    /// Power calls in order: `shutdown`, `power-off`, `terminate`
    lifecycle: Mutex<Vec<&'static str>>,
}

impl FakeMachine {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            attributes: Mutex::new(BTreeMap::new()),
            lifecycle: Mutex::new(Vec::new()),
        })
    }

    fn is_terminated(&self) -> bool {
        self.lifecycle.lock().unwrap().contains(&"terminate")
    }

    fn enter(&self, state: &'static str) {
        self.lifecycle.lock().unwrap().push(state);
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn ip(&self) -> Option<String> {
        Some("10.0.0.10".to_string())
    }

    async fn get_ip(&self, _timeout: Duration) -> Result<String> {
        Ok("10.0.0.10".to_string())
    }

    async fn shutdown(&self) -> Result<()> {
        self.enter("shutdown");
        Ok(())
    }

    async fn power_off(&self) -> Result<()> {
        self.enter("power-off");
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.enter("terminate");
        Ok(())
    }

    async fn set_attributes(&self, attributes: BTreeMap<String, String>) -> Result<()> {
        self.attributes.lock().unwrap().extend(attributes);
        Ok(())
    }

    async fn get_attributes(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.attributes.lock().unwrap().clone())
    }
}

/// Provider whose clones join `platform` right away
pub struct FakeProvider {
    machines: Mutex<BTreeMap<String, Arc<FakeMachine>>>,
    platform: Arc<FakePlatform>,
    clones: Mutex<Vec<String>>,
    payloads: Mutex<BTreeMap<String, String>>,
}

impl FakeProvider {
    pub fn new(platform: Arc<FakePlatform>) -> Arc<Self> {
        Arc::new(Self {
            machines: Mutex::new(BTreeMap::new()),
            platform,
            clones: Mutex::new(Vec::new()),
            payloads: Mutex::new(BTreeMap::new()),
        })
    }

    /// Pre-existing machine created at `secs` since the epoch, joined as a node
    pub fn seed(&self, name: &str, secs: i64) {
        let machine = FakeMachine::new(name);
        let created = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
        *machine.attributes.lock().unwrap() = lineage_attributes("ubuntu", created);
        self.machines
            .lock()
            .unwrap()
            .insert(name.to_string(), machine);
        self.platform.join(name);
    }

    /// Names of live (not terminated) machines
    pub fn live(&self) -> Vec<String> {
        self.machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| !m.is_terminated())
            .map(|m| m.name.clone())
            .collect()
    }

    /// Names of terminated machines
    pub fn terminated(&self) -> BTreeSet<String> {
        self.machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.is_terminated())
            .map(|m| m.name.clone())
            .collect()
    }

    /// Every clone call, in order
    pub fn clones(&self) -> Vec<String> {
        self.clones.lock().unwrap().clone()
    }

    /// User data a machine was cloned with
    pub fn payload(&self, name: &str) -> Option<String> {
        self.payloads.lock().unwrap().get(name).cloned()
    }

    /// Power calls a machine received, in order
    pub fn lifecycle(&self, name: &str) -> Vec<&'static str> {
        self.machines
            .lock()
            .unwrap()
            .get(name)
            .map(|m| m.lifecycle.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MachineProvider for FakeProvider {
    async fn clone_machine(
        &self,
        spec: &MachineSpec,
        bootstrap: &BootstrapConfig,
    ) -> Result<Arc<dyn Machine>> {
        self.clones.lock().unwrap().push(spec.name.clone());
        self.payloads
            .lock()
            .unwrap()
            .insert(spec.name.clone(), bootstrap.user_data.clone());
        let machine = FakeMachine::new(&spec.name);
        self.machines
            .lock()
            .unwrap()
            .insert(spec.name.clone(), machine.clone());
        self.platform.join(&spec.name);
        Ok(machine)
    }

    async fn machines_by_prefix(&self, prefix: &str) -> Result<HashMap<String, Arc<dyn Machine>>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.name.starts_with(prefix) && !m.is_terminated())
            .map(|m| {
                let machine: Arc<dyn Machine> = m.clone();
                (m.name.clone(), machine)
            })
            .collect())
    }
}

/// Bootstrap payload `<role> <hostname> <endpoint>`; refuses to build
/// without an endpoint
pub struct FakeBootstrap;

#[async_trait]
impl BootstrapConfigBuilder for FakeBootstrap {
    async fn build(&self, ctx: &BootstrapContext<'_>) -> Result<BootstrapConfig> {
        if ctx.control_plane_endpoint.is_empty() {
            return Err(Error::bootstrap(format!("{} has no endpoint", ctx.hostname)));
        }
        Ok(BootstrapConfig {
            user_data: format!(
                "{} {} {}",
                ctx.role, ctx.hostname, ctx.control_plane_endpoint
            ),
        })
    }
}

// =============================================================================
// Platform
// =============================================================================

#[derive(Default)]
struct FakeNode {
    info: NodeInfo,
    /// Polls left before a rebooting node reports Ready again
    down_polls: u32,
}

/// Kubernetes API stand-in
#[derive(Default)]
pub struct FakePlatform {
    nodes: Mutex<BTreeMap<String, FakeNode>>,
    events: Mutex<Vec<String>>,
    failing_drains: Mutex<BTreeSet<String>>,
    never_ready: Mutex<BTreeSet<String>>,
    health: Mutex<Health>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            health: Mutex::new(Health {
                running_pods: 20,
                crash_loop_back_off: 0,
            }),
            ..Default::default()
        })
    }

    /// Register a Ready node; names containing `-master-` are control plane
    pub fn join(&self, name: &str) {
        let info = NodeInfo {
            name: name.to_string(),
            is_master: name.contains("-master-"),
            ready: true,
            kubelet_version: Some("v1.30.4".to_string()),
            created: Some(Utc::now()),
            ..Default::default()
        };
        self.nodes.lock().unwrap().insert(
            name.to_string(),
            FakeNode {
                info,
                down_polls: 0,
            },
        );
    }

    pub fn fail_drain(&self, name: &str) {
        self.failing_drains.lock().unwrap().insert(name.to_string());
    }

    pub fn never_ready(&self, name: &str) {
        self.never_ready.lock().unwrap().insert(name.to_string());
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    /// `<verb> <node>` for every mutating call, in order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, name: &str) {
        self.events.lock().unwrap().push(format!("{verb} {name}"));
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn ping(&self) -> bool {
        self.nodes.lock().unwrap().values().any(|n| n.info.is_master)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .map(|n| n.info.clone())
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        let never_ready = self.never_ready.lock().unwrap().contains(name);
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get_mut(name) else {
            return Ok(None);
        };
        if node.down_polls > 0 {
            node.down_polls -= 1;
            node.info.ready = false;
        } else if !never_ready {
            node.info.ready = true;
        }
        Ok(Some(node.info.clone()))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.record("delete", name);
        self.nodes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        self.record("cordon", name);
        Ok(())
    }

    async fn uncordon(&self, name: &str) -> Result<()> {
        self.record("uncordon", name);
        Ok(())
    }

    async fn drain(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.record("drain", name);
        if self.failing_drains.lock().unwrap().contains(name) {
            return Err(Error::drain(name, "pod disruption budget blocks eviction"));
        }
        Ok(())
    }

    async fn run_on_node(&self, name: &str, script: &str, _timeout: Duration) -> Result<String> {
        self.record("reboot", name);
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| Error::provider(format!("no node {name}")))?;
        if script.contains("reboot") {
            node.down_polls = 2;
        }
        Ok(String::new())
    }

    async fn remove_taint(&self, name: &str, key: &str) -> Result<()> {
        self.record("untaint", name);
        if let Some(node) = self.nodes.lock().unwrap().get_mut(name) {
            node.info.taints.retain(|t| t != key);
        }
        Ok(())
    }
}

#[async_trait]
impl HealthSource for FakePlatform {
    async fn health(&self) -> Result<Health> {
        Ok(*self.health.lock().unwrap())
    }
}
