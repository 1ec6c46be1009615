//! Fetches an artifact archive to a local path and extracts it.

use std::path::{Path, PathBuf};

use cm_proto::{CmError, CmResult, ErrorKind};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use cm_transport::Backoff;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

/// Downloads `url` to `dest`. `file://` URLs are copied directly and never
/// retried: a missing local file is a configuration error, not
/// a transient one.
pub async fn fetch(url: &str, dest: &Path, policy: &RetryPolicy) -> CmResult<()> {
    if let Some(local_path) = url.strip_prefix("file://") {
        return tokio::fs::copy(local_path, dest)
            .await
            .map(|_| ())
            .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("copying {local_path}"), e));
    }

    let mut backoff = policy.backoff.clone();
    let mut last_err = None;
    for attempt in 1..=policy.max_attempts {
        match fetch_once(url, dest).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(url, attempt, error = %e, "download attempt failed");
                last_err = Some(e);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CmError::new(ErrorKind::Failed, "download failed, no attempts made")))
}

async fn fetch_once(url: &str, dest: &Path) -> CmResult<()> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("requesting {url}"), e))?;
    if !response.status().is_success() {
        return Err(CmError::new(
            ErrorKind::Failed,
            format!("{url} returned status {}", response.status()),
        ));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("creating {}", dest.display()), e))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CmError::wrap(ErrorKind::Failed, "reading response body", e))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Extracts a `.tar.gz` archive into `dest_dir`, which must not yet exist.
pub fn extract_tar_gz(archive: &Path, dest_dir: &Path) -> CmResult<()> {
    let file = std::fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    std::fs::create_dir_all(dest_dir)?;
    archive
        .unpack(dest_dir)
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "extracting archive", e))?;
    Ok(())
}

/// Lists every regular file under `root`, relative to `root`, in a stable
/// order.
pub fn list_extracted_files(root: &Path) -> CmResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| CmError::wrap(ErrorKind::Failed, "walking extracted tree", e))?;
        if entry.file_type().is_file() {
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walkdir yields paths under root")
                .to_path_buf();
            paths.push(relative);
        }
    }
    debug!(count = paths.len(), "enumerated extracted files");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_url_copies_without_retry() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        tokio::fs::write(&src, b"hello").await.unwrap();
        let dest = dir.path().join("dest.bin");

        fetch(&format!("file://{}", src.display()), &dest, &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_local_file_fails_without_retry_delay() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("dest.bin");
        let start = std::time::Instant::now();
        let err = fetch("file:///no/such/path", &dest, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), cm_proto::ErrorKind::Failed);
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
