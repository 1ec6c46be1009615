//! Per-digest download coalescing.
//!
//! The first caller for a digest becomes the leader and actually runs the
//! download; concurrent callers for the same digest subscribe to the
//! leader's outcome instead of starting their own. On failure the entry is
//! cleared so the next call re-leads, matching "the group is cleared and
//! the next call re-leads".

use std::collections::HashMap;
use std::path::PathBuf;

use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::sync::{broadcast, Mutex};

type Outcome = Result<PathBuf, String>;

#[derive(Default)]
pub struct DownloadCoordinator {
    inflight: Mutex<HashMap<String, broadcast::Sender<Outcome>>>,
}

impl DownloadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `leader` if no download for `digest` is in flight, otherwise
    /// waits for the in-flight one's result.
    pub async fn run_or_join<F, Fut>(&self, digest: &str, leader: F) -> CmResult<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CmResult<PathBuf>>,
    {
        let mut guard = self.inflight.lock().await;
        if let Some(tx) = guard.get(digest) {
            let mut rx = tx.subscribe();
            drop(guard);
            return match rx.recv().await {
                Ok(Ok(path)) => Ok(path),
                Ok(Err(message)) => Err(CmError::new(ErrorKind::Failed, message)),
                Err(_) => Err(CmError::new(
                    ErrorKind::Failed,
                    "download leader exited without publishing a result",
                )),
            };
        }

        let (tx, _rx) = broadcast::channel(1);
        guard.insert(digest.to_string(), tx.clone());
        drop(guard);

        let result = leader().await;
        self.inflight.lock().await.remove(digest);
        let outcome: Outcome = result.as_ref().map(Clone::clone).map_err(|e| e.to_string());
        let _ = tx.send(outcome);
        result
    }
}
