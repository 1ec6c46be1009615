//! Storage/State Supervisor: per-instance storage directory and
//! optional state-file lifecycle, quota enforcement, and state reconciliation
//! with the cloud.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cm_proto::cloud::{CloudMessage, NewStateMessage, StateRequestMessage};
use cm_proto::domain::{InstanceIdent, StorageStateInfo};
use cm_proto::{CmError, CmResult, ErrorKind};
use cm_store::Store;
use cm_transport::CloudTransport;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::quota::{self, QuotaEnforcer};
use crate::watcher::StateWatcher;

pub struct SetupParams {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub gid: u32,
    pub storage_quota: u64,
    pub state_quota: u64,
}

pub struct SetupResult {
    pub storage_path: PathBuf,
    pub state_path: Option<PathBuf>,
}

struct InstanceWatch {
    _watcher: StateWatcher,
}

pub struct StorageStateSupervisor {
    root_dir: PathBuf,
    store: Arc<Store>,
    cloud: Arc<CloudTransport>,
    quota_enforcer: Arc<dyn QuotaEnforcer>,
    watches: Mutex<HashMap<InstanceIdent, InstanceWatch>>,
    checksums: Arc<Mutex<HashMap<InstanceIdent, Vec<u8>>>>,
}

impl StorageStateSupervisor {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        store: Arc<Store>,
        cloud: Arc<CloudTransport>,
        quota_enforcer: Arc<dyn QuotaEnforcer>,
    ) -> Self {
        Self {
            root_dir: root_dir.into(),
            store,
            cloud,
            quota_enforcer,
            watches: Mutex::new(HashMap::new()),
            checksums: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn storage_dir(&self, ident: &InstanceIdent) -> PathBuf {
        self.root_dir.join("storage").join(ident_dir_name(ident))
    }

    fn state_path(&self, ident: &InstanceIdent) -> PathBuf {
        self.root_dir.join("state").join(ident_dir_name(ident)).join("state.bin")
    }

    pub async fn setup(&self, params: SetupParams) -> CmResult<SetupResult> {
        let SetupParams { ident, uid, gid, storage_quota, state_quota } = params;

        let info = match self.store.get_storage_state_info(&ident).await {
            Ok(info) => info,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let info = StorageStateInfo {
                    ident: ident.clone(),
                    instance_id: Uuid::new_v4(),
                    storage_quota,
                    state_quota,
                    state_checksum: Vec::new(),
                };
                self.store.add_storage_state_info(&info).await?;
                info
            }
            Err(e) => return Err(e),
        };

        let storage_dir = self.storage_dir(&ident);
        tokio::fs::create_dir_all(&storage_dir).await?;
        chown(&storage_dir, uid, gid)?;

        let state_path = if state_quota > 0 {
            let state_dir = storage_state_dir(&self.state_path(&ident));
            tokio::fs::create_dir_all(&state_dir).await?;
            let path = self.state_path(&ident);
            if !path.exists() {
                tokio::fs::write(&path, []).await?;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            chown(&path, uid, gid)?;

            self.spawn_watcher(ident.clone(), path.clone()).await?;

            let current = tokio::fs::read(&path).await?;
            let checksum = sha256(&current);
            self.checksums.lock().await.insert(ident.clone(), checksum.clone());
            if checksum != info.state_checksum {
                let _ = self
                    .cloud
                    .send(CloudMessage::StateRequest(StateRequestMessage {
                        instance_ident: ident.clone(),
                        default: info.state_checksum.is_empty(),
                    }))
                    .await;
            }
            Some(path)
        } else {
            None
        };

        if info.storage_quota != storage_quota || info.state_quota != state_quota {
            let state_quota_dir = state_path.as_deref().map(storage_state_dir);
            quota::apply(
                self.quota_enforcer.as_ref(),
                uid,
                &storage_dir,
                storage_quota,
                state_quota_dir.as_deref(),
                state_quota,
            )
            .await?;
            self.store
                .update_storage_state_quotas(&ident, storage_quota, state_quota)
                .await?;
        }

        Ok(SetupResult { storage_path: storage_dir, state_path })
    }

    async fn spawn_watcher(&self, ident: InstanceIdent, path: PathBuf) -> CmResult<()> {
        let (tx, mut rx) = mpsc::channel(4);
        let watcher = StateWatcher::spawn(&path, tx)?;
        self.watches.lock().await.insert(ident.clone(), InstanceWatch { _watcher: watcher });

        let checksums = self.checksums.clone();
        let cloud = self.cloud.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let data = match tokio::fs::read(&path).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(ident = %ident, error = %e, "failed to re-read state file after change");
                        continue;
                    }
                };
                let checksum = sha256(&data);
                let mut guard = checksums.lock().await;
                let changed = guard.get(&ident).map(|c| c != &checksum).unwrap_or(true);
                if !changed {
                    continue;
                }
                guard.insert(ident.clone(), checksum.clone());
                drop(guard);
                if cloud
                    .send(CloudMessage::NewState(NewStateMessage {
                        instance_ident: ident.clone(),
                        state: data,
                        checksum,
                    }))
                    .await
                    .is_err()
                {
                    warn!(ident = %ident, "failed to forward new state, cloud transport unavailable");
                }
            }
        });
        Ok(())
    }

    /// Tears down the watcher; files are left untouched.
    pub async fn cleanup(&self, ident: &InstanceIdent) {
        self.watches.lock().await.remove(ident);
        info!(%ident, "storage state watcher stopped");
    }

    /// Cleans up, then deletes the state file, storage dir and persisted
    /// `StorageStateInfo`.
    pub async fn remove(&self, ident: &InstanceIdent) -> CmResult<()> {
        self.cleanup(ident).await;
        self.checksums.lock().await.remove(ident);

        let state_dir = storage_state_dir(&self.state_path(ident));
        if state_dir.exists() {
            tokio::fs::remove_dir_all(&state_dir).await?;
        }
        let storage_dir = self.storage_dir(ident);
        if storage_dir.exists() {
            tokio::fs::remove_dir_all(&storage_dir).await?;
        }
        self.store.remove_storage_state_info(ident).await
    }

    /// Verifies and writes an authoritative state blob pushed by the cloud
    ///. Any I/O error aborts the write, leaving the
    /// file untouched; a checksum mismatch is `eInvalidChecksum`, distinct
    /// from a generic I/O failure.
    pub async fn update_state(
        &self,
        ident: &InstanceIdent,
        state: Vec<u8>,
        checksum: Vec<u8>,
    ) -> CmResult<()> {
        if sha256(&state) != checksum {
            return Err(CmError::invalid_checksum(format!(
                "state blob for {ident} does not match its declared checksum"
            )));
        }

        let path = self.state_path(ident);
        write_atomically(&path, &state)?;
        self.checksums.lock().await.insert(ident.clone(), checksum);
        Ok(())
    }

    /// On `accepted`, persists the checksum as the new authoritative value
    ///; on anything else, re-requests the authoritative
    /// state.
    pub async fn accept_state(
        &self,
        ident: &InstanceIdent,
        accepted: bool,
        checksum: Vec<u8>,
    ) -> CmResult<()> {
        if accepted {
            self.store.update_storage_state_checksum(ident, &checksum).await
        } else {
            self.cloud
                .send(CloudMessage::StateRequest(StateRequestMessage {
                    instance_ident: ident.clone(),
                    default: false,
                }))
                .await
        }
    }

    pub async fn get_instance_checksum(&self, ident: &InstanceIdent) -> CmResult<Vec<u8>> {
        self.checksums
            .lock()
            .await
            .get(ident)
            .cloned()
            .ok_or_else(|| CmError::not_found(format!("no in-memory checksum for {ident}")))
    }
}

fn ident_dir_name(ident: &InstanceIdent) -> String {
    format!(
        "{}_{}_{}",
        sanitize(&ident.item_id),
        sanitize(&ident.subject_id),
        ident.instance
    )
}

fn sanitize(s: &str) -> String {
    s.replace('/', "_")
}

fn storage_state_dir(state_path: &Path) -> PathBuf {
    state_path.parent().unwrap_or(state_path).to_path_buf()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(unix)]
fn chown(path: &Path, uid: u32, gid: u32) -> CmResult<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("chown {}", path.display()), e))
}

/// Tempfile-then-rename, matching `cm-iam::state`'s `write_state_file`.
fn write_atomically(path: &Path, data: &[u8]) -> CmResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "failed to persist state file", e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::domain::NodeId;
    use cm_transport::{BoxedIo, FnConnector};
    use tempfile::tempdir;

    fn ident() -> InstanceIdent {
        InstanceIdent {
            item_id: "item1".into(),
            subject_id: "subject1".into(),
            instance: 0,
        }
    }

    fn test_cloud() -> Arc<CloudTransport> {
        let connector = Arc::new(FnConnector(|| async {
            Err::<BoxedIo, _>(CmError::new(ErrorKind::Failed, "no network in tests"))
        }));
        let (transport, _events) = CloudTransport::new(
            connector,
            Arc::new(|| cm_proto::domain::NodeInfo {
                node_id: NodeId("node-1".into()),
                node_type: "edge".into(),
                state: cm_proto::domain::NodeState::Provisioned,
                cpus: 1,
                ram_mb: 1,
                partitions: vec![],
                attributes: Default::default(),
            }),
            8,
            std::time::Duration::from_millis(10),
        );
        Arc::new(transport)
    }

    #[derive(Default)]
    struct NoopQuota;

    #[async_trait::async_trait]
    impl QuotaEnforcer for NoopQuota {
        async fn set_user_quota(&self, _path: &Path, _uid: u32, _bytes: u64) -> CmResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn setup_creates_dirs_and_state_file_with_quota_zero_skips_state() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let supervisor = StorageStateSupervisor::new(
            dir.path(),
            store,
            test_cloud(),
            Arc::new(NoopQuota),
        );

        let result = supervisor
            .setup(SetupParams {
                ident: ident(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                storage_quota: 0,
                state_quota: 0,
            })
            .await
            .unwrap();

        assert!(result.storage_path.exists());
        assert!(result.state_path.is_none());
    }

    #[tokio::test]
    async fn update_state_rejects_mismatched_checksum() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let supervisor = StorageStateSupervisor::new(
            dir.path(),
            store,
            test_cloud(),
            Arc::new(NoopQuota),
        );
        supervisor
            .setup(SetupParams {
                ident: ident(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                storage_quota: 0,
                state_quota: 1024,
            })
            .await
            .unwrap();

        let err = supervisor
            .update_state(&ident(), b"hello".to_vec(), b"not-the-real-checksum".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidChecksum);

        let checksum = sha256(b"hello");
        supervisor.update_state(&ident(), b"hello".to_vec(), checksum.clone()).await.unwrap();
        assert_eq!(supervisor.get_instance_checksum(&ident()).await.unwrap(), checksum);
    }
}
