//! Error taxonomy shared by every CM component.
//!
//! `CmError` names the *kind* of failure, not the component that raised it;
//! components wrap a leaf I/O or crypto error with a short context string and
//! bubble it up as one of these variants so callers (in particular the
//! reconciler, which never propagates per-item errors to the cloud) can match
//! on `kind()` instead of on string content.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    Failed,
    InvalidArgument,
    NotFound,
    AlreadyExist,
    NoMemory,
    OutOfRange,
    Timeout,
    WrongState,
    InvalidChecksum,
    Runtime,
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::None => "none",
            ErrorKind::Failed => "failed",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExist => "already_exist",
            ErrorKind::NoMemory => "no_memory",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WrongState => "wrong_state",
            ErrorKind::InvalidChecksum => "invalid_checksum",
            ErrorKind::Runtime => "runtime",
            ErrorKind::NotSupported => "not_supported",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct CmError {
    pub kind: ErrorKind,
    pub context: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CmError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            source: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, context)
    }

    pub fn already_exist(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExist, context)
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, context)
    }

    pub fn wrong_state(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::WrongState, context)
    }

    pub fn invalid_checksum(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidChecksum, context)
    }

    pub fn no_memory(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoMemory, context)
    }
}

pub type CmResult<T> = Result<T, CmError>;

impl From<std::io::Error> for CmError {
    fn from(e: std::io::Error) -> Self {
        CmError::wrap(ErrorKind::Failed, "io error", e)
    }
}

impl From<serde_json::Error> for CmError {
    fn from(e: serde_json::Error) -> Self {
        CmError::wrap(ErrorKind::Failed, "serialization error", e)
    }
}
