//! Identity Agent client: the node's streaming connection to a
//! local IAM process, plus the persisted provisioning state machine IAM
//! drives through it.

pub mod client;
pub mod state;

pub use client::{ConnectionEvent, IamClient, ProvisioningActions};
pub use state::{check_transition, NodeSnapshot, NodeStateStore};
