//! Current node provisioning state: persisted to a one-line
//! state file, held in memory, and published to subscribers exactly once
//! per change.
//!
//! Transition legality (`unprovisioned -> provisioned -> paused -> ...`) is
//! enforced by [`crate::client`] before it calls [`NodeStateStore::set_state`];
//! the store itself is a permissive place to persist+publish, mirroring how
//! a handler that checks allowed states separately from the store that
//! persists and publishes the result.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cm_proto::domain::NodeState;
use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub state: NodeState,
    pub connected: bool,
}

struct Inner {
    state: NodeState,
    connected: bool,
}

pub struct NodeStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    changes: broadcast::Sender<NodeSnapshot>,
}

impl NodeStateStore {
    /// Loads the persisted state, treating a missing file as `unprovisioned`.
    pub fn load(path: impl AsRef<Path>) -> CmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => contents.trim().parse::<NodeState>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NodeState::Unprovisioned,
            Err(e) => return Err(e.into()),
        };

        let (changes, _) = broadcast::channel(32);
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                state,
                connected: false,
            }),
            changes,
        })
    }

    pub fn current(&self) -> NodeSnapshot {
        let inner = self.inner.lock().unwrap();
        NodeSnapshot {
            state: inner.state,
            connected: inner.connected,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeSnapshot> {
        self.changes.subscribe()
    }

    /// Persists the new state unconditionally, but notifies listeners only
    /// if the observable snapshot actually changed.
    pub fn set_state(&self, state: NodeState) -> CmResult<()> {
        write_state_file(&self.path, state)?;
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.state != state;
        inner.state = state;
        let snapshot = NodeSnapshot {
            state: inner.state,
            connected: inner.connected,
        };
        drop(inner);
        if changed {
            let _ = self.changes.send(snapshot);
        }
        Ok(())
    }

    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.connected != connected;
        inner.connected = connected;
        let snapshot = NodeSnapshot {
            state: inner.state,
            connected: inner.connected,
        };
        drop(inner);
        if changed {
            let _ = self.changes.send(snapshot);
        }
    }
}

/// Atomic write: tempfile in the same directory, then rename, so a crash
/// mid-write never leaves a torn state file behind.
fn write_state_file(path: &Path, state: NodeState) -> CmResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(state.as_str().as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| CmError::wrap(ErrorKind::Failed, "failed to persist node state file", e.error))?;
    Ok(())
}

/// Legal node-state transitions. Returns `eWrongState` without mutating
/// anything when the requested action isn't legal from `current`.
pub fn check_transition(current: NodeState, target: NodeState) -> CmResult<()> {
    use NodeState::*;
    let allowed = matches!(
        (current, target),
        (Unprovisioned, Provisioned) | (Provisioned, Paused) | (Paused, Provisioned) | (Provisioned, Unprovisioned) | (Paused, Unprovisioned)
    );
    if allowed {
        Ok(())
    } else {
        Err(CmError::wrong_state(format!(
            "cannot transition node state from {current:?} to {target:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_as_unprovisioned() {
        let dir = tempdir().unwrap();
        let store = NodeStateStore::load(dir.path().join("provisioning-state")).unwrap();
        assert_eq!(store.current().state, NodeState::Unprovisioned);
    }

    #[test]
    fn set_state_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provisioning-state");
        let store = NodeStateStore::load(&path).unwrap();
        store.set_state(NodeState::Provisioned).unwrap();

        let reloaded = NodeStateStore::load(&path).unwrap();
        assert_eq!(reloaded.current().state, NodeState::Provisioned);
    }

    #[test]
    fn listeners_notified_only_on_change() {
        let dir = tempdir().unwrap();
        let store = NodeStateStore::load(dir.path().join("provisioning-state")).unwrap();
        let mut rx = store.subscribe();

        store.set_state(NodeState::Unprovisioned).unwrap(); // no-op, same state
        assert!(rx.try_recv().is_err());

        store.set_state(NodeState::Provisioned).unwrap();
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.state, NodeState::Provisioned);
    }

    #[test]
    fn allowed_transitions_round_trip_between_provisioned_and_paused() {
        assert!(check_transition(NodeState::Unprovisioned, NodeState::Provisioned).is_ok());
        assert!(check_transition(NodeState::Provisioned, NodeState::Paused).is_ok());
        assert!(check_transition(NodeState::Paused, NodeState::Provisioned).is_ok());
        assert!(check_transition(NodeState::Provisioned, NodeState::Unprovisioned).is_ok());
        assert!(check_transition(NodeState::Paused, NodeState::Unprovisioned).is_ok());

        assert_eq!(
            check_transition(NodeState::Unprovisioned, NodeState::Paused)
                .unwrap_err()
                .kind(),
            ErrorKind::WrongState
        );
        assert_eq!(
            check_transition(NodeState::Unprovisioned, NodeState::Unprovisioned)
                .unwrap_err()
                .kind(),
            ErrorKind::WrongState
        );
    }
}
