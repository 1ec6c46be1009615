//! Shared wire and domain types for the node communication manager, plain
//! `serde`-encoded Rust rather than a compiled `.proto` schema: the cloud
//! transport is an external, opaque-channel collaborator, so there's no
//! tonic/prost codegen to mirror.

pub mod cloud;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod iam;
pub mod sm;

pub use error::{CmError, CmResult, ErrorKind};
