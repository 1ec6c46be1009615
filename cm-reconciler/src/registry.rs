//! Tracks the SM channels currently attached to this node and the
//! runtimes each one advertised in its `SmInfo` handshake.

use std::collections::HashMap;
use std::sync::Arc;

use cm_transport::SmChannel;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct SmRegistry {
    inner: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    channel: Arc<SmChannel>,
    runtimes: Vec<String>,
}

impl SmRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub async fn register(&self, sm_node_id: String, channel: Arc<SmChannel>) {
        self.inner.lock().await.insert(sm_node_id, Entry { channel, runtimes: Vec::new() });
    }

    pub async fn unregister(&self, sm_node_id: &str) {
        self.inner.lock().await.remove(sm_node_id);
    }

    pub async fn note_runtimes(&self, sm_node_id: &str, runtimes: Vec<String>) {
        if let Some(entry) = self.inner.lock().await.get_mut(sm_node_id) {
            entry.runtimes = runtimes;
        }
    }

    pub async fn channel(&self, sm_node_id: &str) -> Option<Arc<SmChannel>> {
        self.inner.lock().await.get(sm_node_id).map(|e| e.channel.clone())
    }

    pub async fn runtimes_by_sm(&self) -> HashMap<String, Vec<String>> {
        self.inner.lock().await.iter().map(|(id, e)| (id.clone(), e.runtimes.clone())).collect()
    }

    pub async fn all(&self) -> Vec<(String, Arc<SmChannel>)> {
        self.inner.lock().await.iter().map(|(id, e)| (id.clone(), e.channel.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::{CmError, ErrorKind};
    use cm_transport::connector::{BoxedIo, FnConnector};

    fn dummy_channel(id: &str) -> Arc<SmChannel> {
        let connector = Arc::new(FnConnector(|| async {
            Err::<BoxedIo, _>(CmError::new(ErrorKind::Failed, "no connection in this test"))
        }));
        let (channel, _events) = SmChannel::new(id, connector, 8);
        Arc::new(channel)
    }

    #[tokio::test]
    async fn registered_sm_is_found_by_its_advertised_runtime() {
        let registry = SmRegistry::new();
        registry.register("sm-1".into(), dummy_channel("sm-1")).await;
        registry.note_runtimes("sm-1", vec!["docker".into()]).await;

        let runtimes = registry.runtimes_by_sm().await;
        assert_eq!(runtimes.get("sm-1").unwrap(), &vec!["docker".to_string()]);
        assert!(registry.channel("sm-1").await.is_some());

        registry.unregister("sm-1").await;
        assert!(registry.channel("sm-1").await.is_none());
    }
}
