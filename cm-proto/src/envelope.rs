//! Wire envelope shared by every framed stream (cloud, SM, IAM): a message
//! type tag, an optional correlation id for request/response matching, and
//! a generic payload. The payload stays generic (`serde_json`) here so
//! `cm-transport`'s `FramedStream` never has to know about any specific
//! message's shape — only `kind` is inspected for dispatch.

use serde::{Deserialize, Serialize};

pub const FRAME_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Cloud = 0,
    Sm = 1,
    Iam = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub message_type: String,
    pub correlation_id: Option<String>,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(message_type: impl Into<String>, payload: T) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(
        message_type: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_id: Some(correlation_id.into()),
            payload,
        }
    }
}
