//! Virtual machine handles and the provider that creates them
//!
//! A [`Machine`] is a handle to one instance on the virtualization backend.
//! The orchestrator keeps no database: the creation timestamp and template
//! lineage live on the instance itself as attributes, written right after
//! cloning.
//!
//! [`NodeMachine`] pairs a Kubernetes node with its machine. Either side may
//! be missing:
//!
//! - node without machine: a *null machine* (joined, but not tracked by the
//!   provider)
//! - machine without node: an *orphan* (exists, never joined or already evicted)

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::bootstrap::BootstrapConfig;
use crate::platform::NodeInfo;
use crate::Result;

/// Attribute holding the RFC 3339 creation timestamp
pub const CREATED_ATTRIBUTE: &str = "fleet/created";
/// Attribute holding the template the machine was cloned from
pub const TEMPLATE_ATTRIBUTE: &str = "fleet/template";

/// Handle to one virtual instance
///
/// Lifecycle calls block until the provider confirms the new power state.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Machine: Send + Sync {
    /// Instance name (also the node hostname)
    fn name(&self) -> String;

    /// Last known IP address, if any
    fn ip(&self) -> Option<String>;

    /// Wait up to `timeout` for the instance to report a routable address
    async fn get_ip(&self, timeout: Duration) -> Result<String>;

    /// Graceful guest shutdown
    async fn shutdown(&self) -> Result<()>;

    /// Hard power off
    async fn power_off(&self) -> Result<()>;

    /// Destroy the instance; the handle must not be used afterwards
    async fn terminate(&self) -> Result<()>;

    /// Merge attributes into the instance's metadata
    async fn set_attributes(&self, attributes: BTreeMap<String, String>) -> Result<()>;

    /// Read the instance's metadata attributes
    async fn get_attributes(&self) -> Result<BTreeMap<String, String>>;
}

impl fmt::Debug for dyn Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name())
            .field("ip", &self.ip())
            .finish()
    }
}

/// Everything needed to clone a new instance
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MachineSpec {
    /// Instance name
    pub name: String,
    /// Template/image to clone
    pub template: String,
    /// vCPUs
    pub cpus: Option<u32>,
    /// Memory in GiB
    pub memory_gb: Option<u32>,
    /// Root disk in GiB
    pub disk_gb: Option<u32>,
    /// Network to attach
    pub network: Option<String>,
    /// Provider tags; hooks may add to these before cloning
    pub tags: BTreeMap<String, String>,
}

impl MachineSpec {
    /// Build a spec from a configured template
    pub fn from_template(name: impl Into<String>, template: &crate::config::MachineTemplate) -> Self {
        Self {
            name: name.into(),
            template: template.template.clone(),
            cpus: template.cpus,
            memory_gb: template.memory_gb,
            disk_gb: template.disk_gb,
            network: template.network.clone(),
            tags: template.tags.clone(),
        }
    }
}

/// Virtualization backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineProvider: Send + Sync {
    /// Clone a new instance from `spec.template` booting with `bootstrap`
    async fn clone_machine(
        &self,
        spec: &MachineSpec,
        bootstrap: &BootstrapConfig,
    ) -> Result<Arc<dyn Machine>>;

    /// All instances whose name starts with `prefix`, keyed by name
    async fn machines_by_prefix(&self, prefix: &str) -> Result<HashMap<String, Arc<dyn Machine>>>;
}

/// Creation timestamp stored on a machine, if present and parseable
pub async fn created_at(machine: &dyn Machine) -> Option<DateTime<Utc>> {
    let attributes = machine.get_attributes().await.ok()?;
    parse_created(&attributes)
}

/// Parse the creation attribute out of an attribute map
pub fn parse_created(attributes: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    attributes
        .get(CREATED_ATTRIBUTE)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Attributes written on a freshly cloned machine
pub fn lineage_attributes(template: &str, now: DateTime<Utc>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CREATED_ATTRIBUTE.to_string(), now.to_rfc3339()),
        (TEMPLATE_ATTRIBUTE.to_string(), template.to_string()),
    ])
}

/// A Kubernetes node paired with its machine
#[derive(Clone, Debug)]
pub struct NodeMachine {
    /// Node/machine name
    pub name: String,
    /// Node record, absent for orphans
    pub node: Option<NodeInfo>,
    /// Machine handle, absent for null machines
    pub machine: Option<Arc<dyn Machine>>,
    /// Machine creation time; `None` when untracked or unrecorded
    pub created: Option<DateTime<Utc>>,
}

impl NodeMachine {
    /// Pair a node and machine, reading the machine's creation attribute
    pub async fn new(node: Option<NodeInfo>, machine: Option<Arc<dyn Machine>>) -> Self {
        let name = match (&node, &machine) {
            (Some(n), _) => n.name.clone(),
            (None, Some(m)) => m.name(),
            (None, None) => String::new(),
        };
        let created = match &machine {
            Some(m) => created_at(m.as_ref()).await,
            None => None,
        };
        Self {
            name,
            node,
            machine,
            created,
        }
    }

    /// Joined, but the provider does not know the instance
    pub fn is_null_machine(&self) -> bool {
        self.node.is_some() && self.machine.is_none()
    }

    /// Provider instance that never joined (or was already evicted)
    pub fn is_orphan(&self) -> bool {
        self.node.is_none() && self.machine.is_some()
    }

    /// Whether the node carries a control-plane role
    pub fn is_master(&self) -> bool {
        self.node.as_ref().map(|n| n.is_master).unwrap_or(false)
    }

    /// Age relative to `now`; `None` when the creation time is unknown
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.created
            .and_then(|created| (now - created).to_std().ok())
    }
}

/// Sort oldest-first by machine creation time.
///
/// A missing creation time sorts before every known one, so untracked
/// instances are treated as the oldest of all. The sort is stable: entries
/// with equal (or equally unknown) age keep their input order.
pub fn sort_oldest_first(machines: &mut [NodeMachine]) {
    machines.sort_by_key(|m| m.created);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Simple in-memory machine for unit tests
    #[derive(Debug)]
    pub struct StubMachine {
        pub name: String,
        pub ip: Option<String>,
        pub attributes: Mutex<BTreeMap<String, String>>,
        pub terminated: Mutex<bool>,
    }

    impl StubMachine {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ip: Some("10.0.0.10".to_string()),
                attributes: Mutex::new(BTreeMap::new()),
                terminated: Mutex::new(false),
            })
        }

        pub fn created_at_secs(name: &str, secs: i64) -> Arc<Self> {
            let machine = Self::new(name);
            let created = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            *machine.attributes.lock().unwrap() = lineage_attributes("tmpl", created);
            machine
        }
    }

    #[async_trait]
    impl Machine for StubMachine {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn ip(&self) -> Option<String> {
            self.ip.clone()
        }

        async fn get_ip(&self, _timeout: Duration) -> Result<String> {
            self.ip
                .clone()
                .ok_or_else(|| crate::Error::provider("no ip"))
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }

        async fn power_off(&self) -> Result<()> {
            Ok(())
        }

        async fn terminate(&self) -> Result<()> {
            *self.terminated.lock().unwrap() = true;
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
}
