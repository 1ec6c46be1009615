//! Shared domain entities.
//!
//! These are the types that flow between `cm-store`, `cm-reconciler`,
//! `cm-network`, `cm-images` and `cm-storagestate` — kept in one crate so
//! every component agrees on field names and serde encodings, the same role
//! `nclav-domain` plays for the reconciler/driver/store split in the
//! infra-reconciler sibling of this codebase's teacher.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable node identity, loaded from `nodeIDPath` at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unprovisioned,
    Provisioned,
    Paused,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Unprovisioned => "unprovisioned",
            NodeState::Provisioned => "provisioned",
            NodeState::Paused => "paused",
        }
    }
}

impl std::str::FromStr for NodeState {
    type Err = crate::error::CmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprovisioned" => Ok(NodeState::Unprovisioned),
            "provisioned" => Ok(NodeState::Provisioned),
            "paused" => Ok(NodeState::Paused),
            other => Err(crate::error::CmError::new(
                crate::error::ErrorKind::InvalidArgument,
                format!("unknown node state '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub total_size: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_type: String,
    pub state: NodeState,
    pub cpus: u32,
    pub ram_mb: u64,
    pub partitions: Vec<PartitionInfo>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateItemType {
    Service,
    Layer,
    Component,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateItemState {
    Pending,
    Installed,
    Cached,
    Removed,
}

/// Downloadable content, keyed by `(item_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItem {
    pub item_id: String,
    pub item_type: UpdateItemType,
    pub version: String,
    pub owner_id: String,
    pub index_digest: String,
    pub state: UpdateItemState,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Primary key shared by every per-instance record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InstanceIdent {
    pub item_id: String,
    pub subject_id: String,
    pub instance: u32,
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.item_id, self.subject_id, self.instance)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    Cached,
    Disabled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    pub version: String,
    pub manifest_digest: String,
    pub runtime: String,
    pub target_node: NodeId,
    pub uid: u32,
    pub gid: u32,
    pub priority: i32,
    pub labels: Vec<String>,
    pub env: HashMap<String, String>,
    pub network_id: Option<String>,
    pub exposed_ports: Vec<PortSpec>,
    pub allowed_connections: Vec<ConnectionSpec>,
    pub monitoring_thresholds: Option<MonitoringThresholds>,
    pub state: InstanceState,
    pub storage_quota: u64,
    pub state_quota: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub proto: Proto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        })
    }
}

/// `"itemA/8080/tcp"` style declaration that this instance may reach
/// `itemA`'s exposed port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConnectionSpec {
    pub item_id: String,
    pub port: u16,
    pub proto: Proto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringThresholds {
    pub cpu_percent: Option<f32>,
    pub ram_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStateInfo {
    pub ident: InstanceIdent,
    pub instance_id: uuid::Uuid,
    pub storage_quota: u64,
    pub state_quota: u64,
    pub state_checksum: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub network_id: String,
    pub subnet: String,
    pub vlan_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub network_id: String,
    pub node_id: NodeId,
    pub ip: std::net::IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub src_ip: std::net::IpAddr,
    pub dst_ip: std::net::IpAddr,
    pub proto: Proto,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInstance {
    pub ident: InstanceIdent,
    pub network_id: String,
    pub node_id: NodeId,
    pub ip: std::net::IpAddr,
    pub exposed_ports: Vec<PortSpec>,
    pub dns_servers: Vec<std::net::IpAddr>,
    pub firewall_rules: Vec<FirewallRule>,
}

/// Fleet-wide config document mapping node groups to node types,
/// resource ratios and alert rules.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnitConfig {
    pub node_groups: Vec<NodeGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub subject: String,
    pub node_type: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub cert_type: String,
    pub issuer: String,
    pub serial: String,
    /// base64-encoded DER bytes on the wire; kept decoded here.
    pub der: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateChain {
    pub chain_id: String,
    pub fingerprints: Vec<String>,
}

/// The cloud's full statement of desired state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DesiredStatus {
    pub nodes: Vec<NodeInfo>,
    pub unit_config: Option<UnitConfig>,
    pub items: Vec<UpdateItem>,
    pub instances: Vec<InstanceInfo>,
    pub subjects: Vec<Subject>,
    pub certificates: Vec<Certificate>,
    pub certificate_chains: Vec<CertificateChain>,
}

/// Persisted cursor of the reconciler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    NoUpdate,
    Downloading,
    Ready,
    Installing,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::NoUpdate => "no_update",
            UpdateState::Downloading => "downloading",
            UpdateState::Ready => "ready",
            UpdateState::Installing => "installing",
        }
    }
}

impl std::str::FromStr for UpdateState {
    type Err = crate::error::CmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_update" => Ok(UpdateState::NoUpdate),
            "downloading" => Ok(UpdateState::Downloading),
            "ready" => Ok(UpdateState::Ready),
            "installing" => Ok(UpdateState::Installing),
            other => Err(crate::error::CmError::new(
                crate::error::ErrorKind::InvalidArgument,
                format!("unknown update state '{other}'"),
            )),
        }
    }
}

/// Per-instance result reported upstream after a reconciliation round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRunState {
    Active,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusReport {
    pub ident: InstanceIdent,
    pub state: InstanceRunState,
    pub message: Option<String>,
}
