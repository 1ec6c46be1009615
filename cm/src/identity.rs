//! Node identity: a stable UUID persisted as a
//! one-line file, generated once on first boot. Mirrors the atomic-write
//! pattern `cm_iam::state::NodeStateStore` uses for the provisioning state
//! file — same directory, tempfile-then-rename, so a crash mid-write never
//! corrupts it.

use std::path::Path;

use cm_proto::domain::NodeId;
use cm_proto::{CmError, CmResult, ErrorKind};
use tracing::info;
use uuid::Uuid;

pub async fn load_or_create(path: &Path) -> CmResult<NodeId> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let id = contents.trim();
            if id.is_empty() {
                return Err(CmError::new(ErrorKind::Failed, format!("{} is empty", path.display())));
            }
            Ok(NodeId(id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = Uuid::new_v4().to_string();
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            write_atomically(path, &id).await?;
            info!(node_id = %id, "generated new node id");
            Ok(NodeId(id))
        }
        Err(e) => Err(CmError::wrap(ErrorKind::Failed, format!("reading {}", path.display()), e)),
    }
}

async fn write_atomically(path: &Path, contents: &str) -> CmResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "persisting node id file", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_creates_and_persists_a_fresh_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-id");
        let first = load_or_create(&path).await.unwrap();
        let second = load_or_create(&path).await.unwrap();
        assert_eq!(first, second);
    }
}
