//! etcd membership and leadership maintenance
//!
//! [`EtcdClientGenerator`] hands out clients connected to the etcd member
//! colocated with a given master. Connections go through the API server's
//! port-forward (see [`PortForwardDialer`]) so the operator never needs a
//! route to the masters themselves.
//!
//! [`EtcdMaintenance`] builds the operator-facing operations on top: per-member
//! status, member removal, and leadership transfer. [`EtcdMemberHook`] removes a
//! master's member before its machine is destroyed.

mod proto;
mod tunnel;

pub use tunnel::{EtcdTls, PortForwardDialer};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::DialFailure;
use crate::hooks::{HookContext, ProvisionHook};
use crate::machine::Machine;
use crate::platform::{master_node_names, PlatformApi};
use crate::{Error, Result};

use proto::{AlarmType, EtcdGrpc};

/// Namespace of the static etcd pods
pub const ETCD_NAMESPACE: &str = "kube-system";
/// etcd client port inside the pod
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Static pod name kubeadm gives the etcd member on `node`
pub fn etcd_pod_name(node: &str) -> String {
    format!("etcd-{node}")
}

/// One etcd cluster member
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EtcdMember {
    /// Member ID
    pub id: u64,
    /// Member name (the node name under kubeadm)
    pub name: String,
    /// Non-voting learner
    pub is_learner: bool,
    /// Active alarms raised by this member
    pub alarms: Vec<String>,
}

/// Status as reported by one member
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointStatus {
    /// ID of the reporting member
    pub member_id: u64,
    /// ID of the member this one believes is leader
    pub leader_id: u64,
    /// Server version
    pub version: String,
    /// Backend database size in bytes
    pub db_size: i64,
    /// Raft index
    pub raft_index: u64,
    /// Errors the member reports about itself
    pub errors: Vec<String>,
}

/// An active alarm
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alarm {
    /// Member raising it
    pub member_id: u64,
    /// Alarm name (`NOSPACE`, `CORRUPT`)
    pub alarm: String,
}

/// Client connected to one etcd member
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EtcdClient: Send + Sync {
    /// Node whose member this client talks to
    fn node(&self) -> String;

    /// Cluster membership (alarms not populated)
    async fn member_list(&self) -> Result<Vec<EtcdMember>>;

    /// This member's status
    async fn status(&self) -> Result<EndpointStatus>;

    /// Active alarms across the cluster
    async fn alarms(&self) -> Result<Vec<Alarm>>;

    /// Remove a member by ID
    async fn member_remove(&self, id: u64) -> Result<()>;

    /// Transfer leadership; must be sent to the current leader
    async fn move_leader(&self, target_id: u64) -> Result<()>;
}

impl fmt::Debug for dyn EtcdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdClient").field("node", &self.node()).finish()
    }
}

/// Opens a client to the member on a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EtcdDialer: Send + Sync {
    /// Connect to the member colocated with `node`
    async fn dial(&self, node: &str) -> Result<Arc<dyn EtcdClient>>;
}

/// [`EtcdClient`] over a gRPC channel
pub(crate) struct GrpcEtcdClient {
    node: String,
    grpc: EtcdGrpc,
}

impl GrpcEtcdClient {
    pub(crate) fn new(node: &str, grpc: EtcdGrpc) -> Self {
        Self {
            node: node.to_string(),
            grpc,
        }
    }

    fn rpc_error(&self, rpc: &'static str) -> impl FnOnce(tonic::Status) -> Error + '_ {
        move |status| Error::EtcdRpc {
            node: self.node.clone(),
            rpc,
            status,
        }
    }
}

#[async_trait]
impl EtcdClient for GrpcEtcdClient {
    fn node(&self) -> String {
        self.node.clone()
    }

    async fn member_list(&self) -> Result<Vec<EtcdMember>> {
        let response = self
            .grpc
            .member_list()
            .await
            .map_err(self.rpc_error("MemberList"))?;
        Ok(response
            .members
            .into_iter()
            .map(|m| EtcdMember {
                id: m.id,
                name: m.name,
                is_learner: m.is_learner,
                alarms: Vec::new(),
            })
            .collect())
    }

    async fn status(&self) -> Result<EndpointStatus> {
        let response = self.grpc.status().await.map_err(self.rpc_error("Status"))?;
        Ok(EndpointStatus {
            member_id: response.header.map(|h| h.member_id).unwrap_or_default(),
            leader_id: response.leader,
            version: response.version,
            db_size: response.db_size,
            raft_index: response.raft_index,
            errors: response.errors,
        })
    }

    async fn alarms(&self) -> Result<Vec<Alarm>> {
        let response = self.grpc.alarms().await.map_err(self.rpc_error("Alarm"))?;
        Ok(response
            .alarms
            .iter()
            .filter(|a| a.alarm() != AlarmType::None)
            .map(|a| Alarm {
                member_id: a.member_id,
                alarm: a.alarm().as_str().to_string(),
            })
            .collect())
    }

    async fn member_remove(&self, id: u64) -> Result<()> {
        self.grpc
            .member_remove(id)
            .await
            .map_err(self.rpc_error("MemberRemove"))?;
        Ok(())
    }

    async fn move_leader(&self, target_id: u64) -> Result<()> {
        self.grpc
            .move_leader(target_id)
            .await
            .map_err(self.rpc_error("MoveLeader"))?;
        Ok(())
    }
}

/// A client connected to the leader, plus every candidate that failed on the
/// way there
pub struct LeaderClient {
    /// Client connected to the leader
    pub client: Arc<dyn EtcdClient>,
    /// ID of the leader member
    pub leader_id: u64,
    /// Membership as seen while locating the leader
    pub members: Vec<EtcdMember>,
    /// Candidates that could not be used, in the order tried
    pub failures: Vec<DialFailure>,
}

/// Produces etcd clients for specific masters or for the current leader
#[derive(Clone)]
pub struct EtcdClientGenerator {
    dialer: Arc<dyn EtcdDialer>,
}

impl EtcdClientGenerator {
    /// Generator dialing through `dialer`
    pub fn new(dialer: Arc<dyn EtcdDialer>) -> Self {
        Self { dialer }
    }

    /// Client for the member on `node`
    pub async fn for_node(&self, node: &str) -> Result<Arc<dyn EtcdClient>> {
        self.dialer.dial(node).await
    }

    /// Client for the current leader.
    ///
    /// Candidates are tried in order. A candidate that cannot be dialed or
    /// queried is recorded and the next one tried; the call fails only when
    /// every candidate failed, with all causes attached.
    pub async fn for_leader(&self, candidates: &[String]) -> Result<LeaderClient> {
        let mut failures = Vec::new();

        for node in candidates {
            match self.leader_via(node).await {
                Ok((client, leader_id, members)) => {
                    return Ok(LeaderClient {
                        client,
                        leader_id,
                        members,
                        failures,
                    })
                }
                Err(error) => {
                    debug!(node = %node, error = %error, "etcd candidate failed");
                    failures.push(DialFailure {
                        node: node.clone(),
                        error,
                    });
                }
            }
        }

        Err(Error::EtcdUnavailable(failures))
    }

    async fn leader_via(&self, node: &str) -> Result<(Arc<dyn EtcdClient>, u64, Vec<EtcdMember>)> {
        let client = self.dialer.dial(node).await?;
        let members = client.member_list().await?;
        let leader_id = client.status().await?.leader_id;

        let leader = members
            .iter()
            .find(|m| m.id == leader_id)
            .ok_or_else(|| Error::MemberNotFound(format!("{leader_id:x} (reported leader)")))?;
        if leader.name == node {
            return Ok((client, leader_id, members));
        }

        let leader_client = self.dialer.dial(&leader.name).await?;
        Ok((leader_client, leader_id, members))
    }
}

/// Status of one member as reported to the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member ID
    pub id: u64,
    /// Member name
    pub name: String,
    /// Non-voting learner
    pub is_learner: bool,
    /// Current leader
    pub is_leader: bool,
    /// Server version, when the member answered
    pub version: Option<String>,
    /// Database size in bytes, when the member answered
    pub db_size: Option<i64>,
    /// Active alarms
    pub alarms: Vec<String>,
    /// Why the member could not be queried
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operator-facing etcd maintenance
#[derive(Clone)]
pub struct EtcdMaintenance {
    platform: Arc<dyn PlatformApi>,
    generator: EtcdClientGenerator,
}

impl EtcdMaintenance {
    /// Maintenance over the masters known to `platform`
    pub fn new(platform: Arc<dyn PlatformApi>, generator: EtcdClientGenerator) -> Self {
        Self {
            platform,
            generator,
        }
    }

    /// Connect to the leader using every master as a candidate
    pub async fn leader(&self) -> Result<LeaderClient> {
        let masters = master_node_names(self.platform.as_ref()).await?;
        let leader = self.generator.for_leader(&masters).await?;
        for failure in &leader.failures {
            warn!(node = %failure.node, error = %failure.error, "skipped unreachable etcd member");
        }
        Ok(leader)
    }

    /// Members with their alarms attached
    pub async fn members(&self) -> Result<Vec<EtcdMember>> {
        let leader = self.leader().await?;
        let alarms = leader.client.alarms().await?;
        Ok(attach_alarms(leader.members, &alarms))
    }

    /// Status of every member; unreachable members carry their error
    pub async fn status(&self) -> Result<Vec<MemberStatus>> {
        let leader = self.leader().await?;
        let alarms = leader.client.alarms().await?;
        let members = attach_alarms(leader.members, &alarms);

        let mut statuses = Vec::with_capacity(members.len());
        for member in members {
            let mut status = MemberStatus {
                id: member.id,
                name: member.name.clone(),
                is_learner: member.is_learner,
                is_leader: member.id == leader.leader_id,
                version: None,
                db_size: None,
                alarms: member.alarms,
                error: None,
            };
            let reported = match self.generator.for_node(&member.name).await {
                Ok(client) => client.status().await,
                Err(e) => Err(e),
            };
            match reported {
                Ok(s) => {
                    status.version = Some(s.version);
                    status.db_size = Some(s.db_size);
                }
                Err(e) => status.error = Some(e.to_string()),
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Remove the member named `name`
    pub async fn remove_member(&self, name: &str) -> Result<()> {
        let leader = self.leader().await?;
        let member = find_member(&leader.members, name)?;
        leader.client.member_remove(member.id).await?;
        info!(member = %name, id = member.id, "removed etcd member");
        Ok(())
    }

    /// Make `name` the leader; a no-op when it already is
    pub async fn move_leader(&self, name: &str) -> Result<()> {
        let leader = self.leader().await?;
        let target = find_member(&leader.members, name)?;
        if target.id == leader.leader_id {
            info!(member = %name, "already etcd leader");
            return Ok(());
        }
        leader.client.move_leader(target.id).await?;
        info!(member = %name, "moved etcd leadership");
        Ok(())
    }

    /// If `node` leads, hand leadership to another voting member
    pub async fn step_down(&self, node: &str) -> Result<()> {
        let leader = self.leader().await?;
        let is_leader = leader
            .members
            .iter()
            .any(|m| m.id == leader.leader_id && m.name == node);
        if !is_leader {
            return Ok(());
        }
        let Some(successor) = leader
            .members
            .iter()
            .find(|m| m.name != node && !m.is_learner)
        else {
            warn!(node = %node, "no other voting etcd member to take leadership");
            return Ok(());
        };
        leader.client.move_leader(successor.id).await?;
        info!(from = %node, to = %successor.name, "moved etcd leadership");
        Ok(())
    }
}

fn find_member<'a>(members: &'a [EtcdMember], name: &str) -> Result<&'a EtcdMember> {
    members
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::MemberNotFound(name.to_string()))
}

fn attach_alarms(mut members: Vec<EtcdMember>, alarms: &[Alarm]) -> Vec<EtcdMember> {
    let mut by_member: HashMap<u64, Vec<String>> = HashMap::new();
    for alarm in alarms {
        by_member
            .entry(alarm.member_id)
            .or_default()
            .push(alarm.alarm.clone());
    }
    for member in &mut members {
        if let Some(alarms) = by_member.remove(&member.id) {
            member.alarms = alarms;
        }
    }
    members
}

/// Removes a master's etcd member before its machine is destroyed
pub struct EtcdMemberHook {
    maintenance: EtcdMaintenance,
}

impl EtcdMemberHook {
    /// Hook removing members through `maintenance`
    pub fn new(maintenance: EtcdMaintenance) -> Self {
        Self { maintenance }
    }
}

#[async_trait]
impl ProvisionHook for EtcdMemberHook {
    fn name(&self) -> &str {
        "etcd-member"
    }

    async fn before_terminate(&self, ctx: &HookContext<'_>, machine: &dyn Machine) -> Result<()> {
        if !ctx.role.is_master() {
            return Ok(());
        }
        let name = machine.name();
        match self.maintenance.remove_member(&name).await {
            Err(Error::MemberNotFound(_)) => {
                debug!(member = %name, "no etcd member to remove");
                Ok(())
            }
            other => other,
        }
    }
}
