//! IAM wire messages. Keyed by `nodeID`, request/response
//! pairs correlated by `correlation_id` on the shared `Envelope`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system_id: String,
    pub unit_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertInfo {
    pub cert_type: String,
    pub issuer: String,
    pub serial: String,
    pub key_url: String,
    pub cert_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartProvisioningRequest {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishProvisioningRequest {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseNodeRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeNodeRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    pub cert_type: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub cert_type: String,
    pub csr: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyCertRequest {
    pub cert_type: String,
    /// base64-encoded DER bytes.
    pub cert: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyCertResponse {
    pub cert_type: String,
    pub cert_url: String,
    pub serial: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCertTypesRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCertTypesResponse {
    pub types: Vec<String>,
    pub error: Option<String>,
}

/// Generic empty-error acknowledgement used by the state-transition RPCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IamRequest {
    GetSystemInfo,
    GetSubjects,
    GetCert {
        cert_type: String,
        issuer: String,
        serial: String,
    },
    StartProvisioning(StartProvisioningRequest),
    FinishProvisioning(FinishProvisioningRequest),
    Deprovision(DeprovisionRequest),
    PauseNode(PauseNodeRequest),
    ResumeNode(ResumeNodeRequest),
    CreateKey(CreateKeyRequest),
    ApplyCert(ApplyCertRequest),
    GetCertTypes(GetCertTypesRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IamResponse {
    SystemInfo(SystemInfo),
    Subjects(Vec<String>),
    Cert(CertInfo),
    Ack(Ack),
    CreateKey(CreateKeyResponse),
    ApplyCert(ApplyCertResponse),
    GetCertTypes(GetCertTypesResponse),
}

/// Asynchronous, unsolicited notifications the IAM stream may push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IamNotification {
    SubjectsChanged(Vec<String>),
    CertChanged { cert_type: String },
}
