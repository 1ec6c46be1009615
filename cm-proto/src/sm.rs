//! SM wire messages — one `SmChannel` per registered worker.

use serde::{Deserialize, Serialize};

use crate::domain::{InstanceIdent, InstanceRunState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmInfo {
    pub sm_node_id: String,
    pub runtimes: Vec<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigStatus {
    pub node_id: String,
    pub config_version: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub state: InstanceRunState,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitoring {
    pub node_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cpu_percent: f32,
    pub ram_mb: u64,
    pub instances: Vec<InstanceMonitoring>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMonitoring {
    pub ident: InstanceIdent,
    pub cpu_percent: f32,
    pub ram_mb: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SystemQuota,
    InstanceQuota,
    ResourceAllocate,
    System,
    Core,
    Instance,
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub ident: Option<InstanceIdent>,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub request_id: String,
    pub part: u32,
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContentRequest {
    pub request_id: String,
    pub digest: String,
}

/// One chunk of an extracted artifact streamed to an SM that could not reach
/// the upstream directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContent {
    pub request_id: String,
    pub parts_count: u32,
    pub part: u32,
    pub relative_path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContentInfo {
    pub request_id: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDelta {
    pub ident: InstanceIdent,
    pub version: String,
}

/// Per-SM delta computed in `4.H` step 4 (`stop[]`, `start[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInstances {
    pub stop: Vec<InstanceDelta>,
    pub start: Vec<crate::domain::InstanceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNetworks {
    pub networks: Vec<crate::domain::NetworkInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLogRequest {
    pub request_id: String,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceLogRequest {
    pub request_id: String,
    pub ident: InstanceIdent,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCrashLogRequest {
    pub request_id: String,
    pub ident: InstanceIdent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmMessage {
    SmInfo(SmInfo),
    NodeConfigStatus(NodeConfigStatus),
    InstanceStatus(InstanceStatus),
    Monitoring(Monitoring),
    Alert(Alert),
    Log(LogChunk),
    ImageContentRequest(ImageContentRequest),
    ImageContent(ImageContent),
    ImageContentInfo(ImageContentInfo),
    UpdateInstances(UpdateInstances),
    UpdateNetworks(UpdateNetworks),
    SystemLogRequest(SystemLogRequest),
    InstanceLogRequest(InstanceLogRequest),
    InstanceCrashLogRequest(InstanceCrashLogRequest),
}
