//! Monitoring & Alerts Forwarder: aggregates per-SM monitoring
//! pushes into instant + averaged views and forwards alerts upstream. No
//! local persistence beyond a small bounded in-memory buffer retained while
//! the cloud transport is down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cm_proto::cloud::{CloudMessage, NodeMonitoringReport};
use cm_proto::domain::InstanceIdent;
use cm_proto::sm::{Alert, InstanceMonitoring, Monitoring};
use cm_proto::CmResult;
use cm_transport::CloudTransport;
use tokio::sync::Mutex;
use tracing::warn;

pub struct MonitorConfig {
    /// Number of trailing samples per SM averaged into `average_*` fields.
    pub average_window: usize,
    /// Alerts retained in memory while the cloud transport is unreachable.
    pub alert_buffer_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            average_window: 12,
            alert_buffer_capacity: 256,
        }
    }
}

struct SmHistory {
    samples: VecDeque<Monitoring>,
}

/// Aggregates `Monitoring` and `Alert` pushes from every SM Channel and
/// relays them upstream through the Cloud Transport.
pub struct MonitoringForwarder {
    cloud: Arc<CloudTransport>,
    config: MonitorConfig,
    history: Mutex<HashMap<String, SmHistory>>,
    alert_buffer: Mutex<VecDeque<Alert>>,
}

impl MonitoringForwarder {
    pub fn new(cloud: Arc<CloudTransport>, config: MonitorConfig) -> Self {
        Self {
            cloud,
            config,
            history: Mutex::new(HashMap::new()),
            alert_buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Folds one SM's monitoring push into its rolling window, builds the
    /// node-level instant+average report, and forwards it upstream.
    pub async fn record_monitoring(&self, sample: Monitoring) -> CmResult<()> {
        let node_id = sample.node_id.clone();
        let report = {
            let mut history = self.history.lock().await;
            let entry = history.entry(node_id.clone()).or_insert_with(|| SmHistory {
                samples: VecDeque::new(),
            });
            entry.samples.push_back(sample.clone());
            while entry.samples.len() > self.config.average_window.max(1) {
                entry.samples.pop_front();
            }
            build_report(&sample, &entry.samples)
        };
        self.cloud.send(CloudMessage::Monitoring(report)).await
    }

    /// Buffers `alert` (bounded, oldest-dropped) and attempts immediate
    /// delivery; a disconnected cloud transport leaves it for the next
    /// `flush_alerts` call rather than failing the caller.
    pub async fn record_alert(&self, alert: Alert) {
        {
            let mut buffer = self.alert_buffer.lock().await;
            if buffer.len() >= self.config.alert_buffer_capacity {
                buffer.pop_front();
            }
            buffer.push_back(alert.clone());
        }
        if self.cloud.send(CloudMessage::Alert(alert)).await.is_err() {
            warn!("alert forward failed, retained in buffer for the next flush");
        }
    }

    /// Re-attempts delivery of every buffered alert, e.g. on cloud
    /// reconnect; delivered alerts are removed, undelivered ones stay
    /// buffered (still bounded by `alert_buffer_capacity`).
    pub async fn flush_alerts(&self) {
        let pending: Vec<Alert> = self.alert_buffer.lock().await.iter().cloned().collect();
        let mut delivered = 0;
        for alert in &pending {
            if self.cloud.send(CloudMessage::Alert(alert.clone())).await.is_ok() {
                delivered += 1;
            } else {
                break;
            }
        }
        if delivered > 0 {
            let mut buffer = self.alert_buffer.lock().await;
            for _ in 0..delivered {
                buffer.pop_front();
            }
        }
    }

    pub async fn buffered_alert_count(&self) -> usize {
        self.alert_buffer.lock().await.len()
    }
}

fn build_report(latest: &Monitoring, window: &VecDeque<Monitoring>) -> NodeMonitoringReport {
    let count = window.len().max(1) as f32;
    let average_cpu_percent = window.iter().map(|s| s.cpu_percent).sum::<f32>() / count;
    let average_ram_mb = (window.iter().map(|s| s.ram_mb).sum::<u64>() as f64 / count as f64) as u64;

    let mut instance_totals: HashMap<InstanceIdent, (f32, u64, u32)> = HashMap::new();
    for sample in window {
        for instance in &sample.instances {
            let entry = instance_totals.entry(instance.ident.clone()).or_insert((0.0, 0, 0));
            entry.0 += instance.cpu_percent;
            entry.1 += instance.ram_mb;
            entry.2 += 1;
        }
    }
    let instances = latest
        .instances
        .iter()
        .map(|instant| {
            let (cpu_total, ram_total, n) = instance_totals
                .get(&instant.ident)
                .copied()
                .unwrap_or((instant.cpu_percent, instant.ram_mb, 1));
            let n = n.max(1) as f32;
            InstanceMonitoring {
                ident: instant.ident.clone(),
                cpu_percent: cpu_total / n,
                ram_mb: (ram_total as f32 / n) as u64,
            }
        })
        .collect();

    NodeMonitoringReport {
        node_id: latest.node_id.clone(),
        timestamp: latest.timestamp,
        instant_cpu_percent: latest.cpu_percent,
        instant_ram_mb: latest.ram_mb,
        average_cpu_percent,
        average_ram_mb,
        instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::domain::{NodeId, NodeState};
    use cm_proto::sm::AlertKind;
    use cm_proto::{CmError, ErrorKind};
    use cm_transport::{BoxedIo, FnConnector};
    use std::time::Duration;

    fn test_node_info() -> cm_proto::domain::NodeInfo {
        cm_proto::domain::NodeInfo {
            node_id: NodeId("node-1".into()),
            node_type: "edge".into(),
            state: NodeState::Provisioned,
            cpus: 1,
            ram_mb: 1,
            partitions: vec![],
            attributes: Default::default(),
        }
    }

    fn unreachable_cloud() -> Arc<CloudTransport> {
        let connector = Arc::new(FnConnector(|| async {
            Err::<BoxedIo, _>(CmError::new(ErrorKind::Failed, "no network in tests"))
        }));
        let (transport, _events) =
            CloudTransport::new(connector, Arc::new(test_node_info), 8, Duration::from_millis(5));
        Arc::new(transport)
    }

    fn sample(cpu: f32, ram: u64) -> Monitoring {
        Monitoring {
            node_id: "node-1".into(),
            timestamp: chrono::Utc::now(),
            cpu_percent: cpu,
            ram_mb: ram,
            instances: vec![InstanceMonitoring {
                ident: InstanceIdent { item_id: "svc".into(), subject_id: "sub".into(), instance: 0 },
                cpu_percent: cpu,
                ram_mb: ram,
            }],
        }
    }

    #[tokio::test]
    async fn average_tracks_the_trailing_window() {
        let forwarder = MonitoringForwarder::new(
            unreachable_cloud(),
            MonitorConfig { average_window: 2, alert_buffer_capacity: 8 },
        );
        // cloud is unreachable so `record_monitoring` returns an error, but the
        // rolling window is updated before the send attempt.
        let _ = forwarder.record_monitoring(sample(10.0, 100)).await;
        let _ = forwarder.record_monitoring(sample(20.0, 200)).await;
        let _ = forwarder.record_monitoring(sample(30.0, 300)).await;

        let history = forwarder.history.lock().await;
        let window = &history.get("node-1").unwrap().samples;
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].cpu_percent, 20.0);
        assert_eq!(window[1].cpu_percent, 30.0);
    }

    #[tokio::test]
    async fn alert_buffer_drops_oldest_past_capacity() {
        let forwarder = MonitoringForwarder::new(
            unreachable_cloud(),
            MonitorConfig { average_window: 4, alert_buffer_capacity: 2 },
        );
        for i in 0..3 {
            forwarder
                .record_alert(Alert {
                    kind: AlertKind::System,
                    ident: None,
                    message: format!("alert-{i}"),
                    timestamp: chrono::Utc::now(),
                })
                .await;
        }
        assert_eq!(forwarder.buffered_alert_count().await, 2);
        let buffer = forwarder.alert_buffer.lock().await;
        assert_eq!(buffer[0].message, "alert-1");
        assert_eq!(buffer[1].message, "alert-2");
    }
}
