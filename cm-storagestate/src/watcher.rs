//! State-file watcher. `original_source/storagestate.hpp`'s
//! `FSEventSubscriber` is single-threaded and per-instance; this mirrors
//! that instead of sharing one watcher loop across every instance.

use std::path::Path;
use std::time::Duration;

use cm_proto::{CmError, CmResult, ErrorKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEBOUNCE: Duration = Duration::from_secs(1);

/// Watches a single state file, debouncing raw fs events into at most one
/// `changed` notification per quiet period.
pub struct StateWatcher {
    _watcher: RecommendedWatcher,
    shutdown: CancellationToken,
}

impl StateWatcher {
    pub fn spawn(path: &Path, on_change: mpsc::Sender<()>) -> CmResult<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = raw_tx.send(());
                }
            }
        })
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "creating state file watcher", e))?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| CmError::wrap(ErrorKind::Failed, format!("watching {}", path.display()), e))?;

        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => return,
                    event = raw_rx.recv() => {
                        if event.is_none() {
                            return;
                        }
                        tokio::select! {
                            _ = task_shutdown.cancelled() => return,
                            _ = tokio::time::sleep(DEBOUNCE) => {}
                        }
                        while raw_rx.try_recv().is_ok() {}
                        if on_change.send(()).await.is_err() {
                            debug!("state watcher's receiver dropped, stopping");
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher, shutdown })
    }
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_to_watched_file_fires_after_debounce() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.bin");
        tokio::fs::write(&path, b"initial").await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let _watcher = StateWatcher::spawn(&path, tx).unwrap();

        tokio::fs::write(&path, b"changed").await.unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(fired.is_ok(), "expected a debounced change notification");
    }
}
