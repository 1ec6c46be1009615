//! Storage/State Supervisor: per-instance storage directories,
//! optional state files with debounced change detection, and quota
//! enforcement.

mod quota;
mod service;
mod watcher;

pub use quota::{QuotaEnforcer, SetquotaEnforcer};
pub use service::{SetupParams, SetupResult, StorageStateSupervisor};
