//! Cloud wire messages. Carried as the payload of an
//! `Envelope<CloudMessage>` framed by `cm-transport::FramedStream`.

use serde::{Deserialize, Serialize};

use crate::domain::{
    Certificate, CertificateChain, DesiredStatus, InstanceIdent, InstanceStatusReport, NodeInfo,
    Subject, UnitConfig, UpdateItem,
};

/// Down: the cloud's statement of what should run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredStatusMessage {
    pub nodes: Vec<NodeInfo>,
    pub unit_config: Option<UnitConfig>,
    pub items: Vec<UpdateItem>,
    pub instances: Vec<crate::domain::InstanceInfo>,
    pub subjects: Vec<Subject>,
    pub certificates: Vec<Certificate>,
    pub certificate_chains: Vec<CertificateChain>,
}

impl From<DesiredStatus> for DesiredStatusMessage {
    fn from(d: DesiredStatus) -> Self {
        Self {
            nodes: d.nodes,
            unit_config: d.unit_config,
            items: d.items,
            instances: d.instances,
            subjects: d.subjects,
            certificates: d.certificates,
            certificate_chains: d.certificate_chains,
        }
    }
}

impl From<DesiredStatusMessage> for DesiredStatus {
    fn from(d: DesiredStatusMessage) -> Self {
        Self {
            nodes: d.nodes,
            unit_config: d.unit_config,
            items: d.items,
            instances: d.instances,
            subjects: d.subjects,
            certificates: d.certificates,
            certificate_chains: d.certificate_chains,
        }
    }
}

/// Up: snapshot of current node/instance state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnitStatusMessage {
    pub nodes: Vec<NodeInfo>,
    pub services: Vec<UpdateItem>,
    pub layers: Vec<UpdateItem>,
    pub components: Vec<UpdateItem>,
    pub instances: Vec<InstanceStatusReport>,
    pub unit_config: Option<UnitConfig>,
}

/// Up: authoritative state blob written locally, forwarded for audit/backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStateMessage {
    pub instance_ident: InstanceIdent,
    pub state: Vec<u8>,
    pub checksum: Vec<u8>,
}

/// Up: ask the cloud to (re-)send the authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRequestMessage {
    pub instance_ident: InstanceIdent,
    pub default: bool,
}

/// Down: the cloud pushes an authoritative state blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStateMessage {
    pub instance_ident: InstanceIdent,
    pub state: Vec<u8>,
    pub checksum: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateAcceptResult {
    Accepted,
    Rejected,
}

/// Down: the cloud's verdict on a `NewStateMessage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAcceptanceMessage {
    pub instance_ident: InstanceIdent,
    pub result: StateAcceptResult,
    pub checksum: Vec<u8>,
}

/// Hello frame sent on connect and on every reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoHello {
    pub node: NodeInfo,
}

/// Up: averaged + instantaneous resource usage for one node, aggregated from
/// every SM's `Monitoring` pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMonitoringReport {
    pub node_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub instant_cpu_percent: f32,
    pub instant_ram_mb: u64,
    pub average_cpu_percent: f32,
    pub average_ram_mb: u64,
    pub instances: Vec<crate::sm::InstanceMonitoring>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloudMessage {
    DesiredStatus(DesiredStatusMessage),
    UnitStatus(UnitStatusMessage),
    NewState(NewStateMessage),
    StateRequest(StateRequestMessage),
    UpdateState(UpdateStateMessage),
    StateAcceptance(StateAcceptanceMessage),
    Hello(NodeInfoHello),
    /// Provisioning request/response pairs forwarded between IAM and cloud,
    /// each keyed by `correlation_id` on the envelope.
    ProvisioningRequest { request: String },
    ProvisioningResponse { error: Option<String> },
    Monitoring(NodeMonitoringReport),
    Alert(crate::sm::Alert),
}
