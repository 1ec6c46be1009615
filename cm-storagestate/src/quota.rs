//! Disk-quota application.
//!
//! Real enforcement shells out to `setquota`, the same way a route
//! reconciler might shell out to `ip`.

use std::path::Path;

use async_trait::async_trait;
use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::process::Command;

#[async_trait]
pub trait QuotaEnforcer: Send + Sync {
    async fn set_user_quota(&self, path: &Path, uid: u32, bytes: u64) -> CmResult<()>;
}

pub struct SetquotaEnforcer;

#[async_trait]
impl QuotaEnforcer for SetquotaEnforcer {
    async fn set_user_quota(&self, path: &Path, uid: u32, bytes: u64) -> CmResult<()> {
        let blocks = bytes.div_ceil(1024);
        let output = Command::new("setquota")
            .arg("-u")
            .arg(uid.to_string())
            .arg(blocks.to_string())
            .arg(blocks.to_string())
            .arg("0")
            .arg("0")
            .arg(path)
            .output()
            .await
            .map_err(|e| CmError::wrap(ErrorKind::Failed, "spawning setquota", e))?;
        if !output.status.success() {
            return Err(CmError::new(
                ErrorKind::Failed,
                format!(
                    "setquota for uid {uid} on {} failed: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(())
    }
}

/// Applies storage/state quotas: a single combined quota when both
/// directories share a partition, two independent quotas otherwise.
pub async fn apply(
    enforcer: &dyn QuotaEnforcer,
    uid: u32,
    storage_dir: &Path,
    storage_quota: u64,
    state_dir: Option<&Path>,
    state_quota: u64,
) -> CmResult<()> {
    match state_dir {
        Some(state_dir) if same_partition(storage_dir, state_dir)? => {
            enforcer
                .set_user_quota(storage_dir, uid, storage_quota + state_quota)
                .await
        }
        Some(state_dir) => {
            enforcer.set_user_quota(storage_dir, uid, storage_quota).await?;
            enforcer.set_user_quota(state_dir, uid, state_quota).await
        }
        None => enforcer.set_user_quota(storage_dir, uid, storage_quota).await,
    }
}

fn same_partition(a: &Path, b: &Path) -> CmResult<bool> {
    use std::os::unix::fs::MetadataExt;
    let a_dev = std::fs::metadata(a)?.dev();
    let b_dev = std::fs::metadata(b)?.dev();
    Ok(a_dev == b_dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingEnforcer {
        calls: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl QuotaEnforcer for RecordingEnforcer {
        async fn set_user_quota(&self, path: &Path, _uid: u32, bytes: u64) -> CmResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push((path.display().to_string(), bytes));
            Ok(())
        }
    }

    #[tokio::test]
    async fn same_partition_dirs_get_one_combined_quota() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("storage");
        let state = dir.path().join("state");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::create_dir_all(&state).unwrap();

        let enforcer = RecordingEnforcer::default();
        apply(&enforcer, 1000, &storage, 100, Some(&state), 50)
            .await
            .unwrap();

        let calls = enforcer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, 150);
    }
}
