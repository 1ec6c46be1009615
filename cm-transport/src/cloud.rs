//! Cloud Transport: one logical stream to the cloud control
//! plane, with reconnect, backpressure and a hello-on-(re)connect frame.

use std::sync::Arc;
use std::time::Duration;

use cm_proto::cloud::{CloudMessage, NodeInfoHello};
use cm_proto::domain::NodeInfo;
use cm_proto::envelope::{Envelope, StreamKind};
use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::connector::Connect;
use crate::framing::FramedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Supplies the current `NodeInfo` for the hello frame sent on every
/// (re)connect.
pub trait NodeInfoSource: Send + Sync {
    fn current(&self) -> NodeInfo;
}

impl<F: Fn() -> NodeInfo + Send + Sync> NodeInfoSource for F {
    fn current(&self) -> NodeInfo {
        self()
    }
}

pub struct CloudTransport {
    connector: Arc<dyn Connect>,
    node_info: Arc<dyn NodeInfoSource>,
    outbound_tx: mpsc::Sender<Envelope<CloudMessage>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Envelope<CloudMessage>>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
    enqueue_timeout: Duration,
}

impl CloudTransport {
    /// `queue_capacity` bounds the outbound queue;
    /// the precise number is configuration-driven.
    /// The caller builds its own incoming channel and passes the sender half
    /// to `run`, keeping the receiver half to consume dispatched messages.
    pub fn new(
        connector: Arc<dyn Connect>,
        node_info: Arc<dyn NodeInfoSource>,
        queue_capacity: usize,
        enqueue_timeout: Duration,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(16);

        let this = Self {
            connector,
            node_info,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events_tx,
            shutdown: CancellationToken::new(),
            enqueue_timeout,
        };
        (this, events_rx)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Enqueues a message for delivery. Blocks up to `enqueue_timeout`; on a
    /// full queue (peer unreachable) returns `eTimeout` rather than stalling
    /// the caller forever.
    pub async fn send(&self, message: CloudMessage) -> CmResult<()> {
        let envelope = Envelope::new(message_type_of(&message), message);
        tokio::time::timeout(self.enqueue_timeout, self.outbound_tx.send(envelope))
            .await
            .map_err(|_| CmError::timeout("cloud transport outbound queue full"))?
            .map_err(|_| CmError::new(ErrorKind::Failed, "cloud transport outbound queue closed"))
    }

    /// Runs the reconnect loop until `stop()`/its cancellation token fires.
    /// Consumes `incoming_tx` produced by `new` — callers hold the matching
    /// receiver handed back from `new`.
    pub async fn run(&self, incoming_tx: mpsc::Sender<Envelope<CloudMessage>>) {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("CloudTransport::run called more than once");
        let mut backoff = Backoff::default();

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self.connector.connect().await {
                Ok(io) => {
                    backoff.reset();
                    info!("cloud transport connected");
                    let _ = self.events_tx.send(ConnectionEvent::Connected).await;

                    let mut stream = FramedStream::new(io);
                    let hello = Envelope::new(
                        "hello",
                        CloudMessage::Hello(NodeInfoHello {
                            node: self.node_info.current(),
                        }),
                    );
                    if let Err(e) = stream.write_json(StreamKind::Cloud as u8, &hello).await {
                        warn!(error = %e, "failed to send hello frame, reconnecting");
                        let _ = self.events_tx.send(ConnectionEvent::Disconnected).await;
                        self.sleep_backoff(&mut backoff).await;
                        continue;
                    }

                    self.pump(&mut stream, &mut outbound_rx, &incoming_tx).await;
                    let _ = self.events_tx.send(ConnectionEvent::Disconnected).await;
                }
                Err(e) => {
                    debug!(error = %e, "cloud transport connect failed");
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            self.sleep_backoff(&mut backoff).await;
        }
    }

    async fn sleep_backoff(&self, backoff: &mut Backoff) {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Services one live connection until it fails or shutdown is requested.
    async fn pump<S>(
        &self,
        stream: &mut FramedStream<S>,
        outbound_rx: &mut mpsc::Receiver<Envelope<CloudMessage>>,
        incoming_tx: &mpsc::Sender<Envelope<CloudMessage>>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(envelope) => {
                            if let Err(e) = stream.write_json(StreamKind::Cloud as u8, &envelope).await {
                                error!(error = %e, "cloud transport write failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = stream.read_json::<Envelope<CloudMessage>>() => {
                    match incoming {
                        Ok(Some((_, envelope))) => {
                            if incoming_tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            info!("cloud transport stream closed by peer");
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "cloud transport read failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn message_type_of(message: &CloudMessage) -> &'static str {
    match message {
        CloudMessage::DesiredStatus(_) => "desired_status",
        CloudMessage::UnitStatus(_) => "unit_status",
        CloudMessage::NewState(_) => "new_state",
        CloudMessage::StateRequest(_) => "state_request",
        CloudMessage::UpdateState(_) => "update_state",
        CloudMessage::StateAcceptance(_) => "state_acceptance",
        CloudMessage::Hello(_) => "hello",
        CloudMessage::ProvisioningRequest { .. } => "provisioning_request",
        CloudMessage::ProvisioningResponse { .. } => "provisioning_response",
        CloudMessage::Monitoring(_) => "monitoring",
        CloudMessage::Alert(_) => "alert",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{BoxedIo, FnConnector};
    use cm_proto::domain::{NodeId, NodeState};
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex as AsyncMutex;

    fn test_node_info() -> NodeInfo {
        NodeInfo {
            node_id: NodeId("node-1".into()),
            node_type: "edge".into(),
            state: NodeState::Provisioned,
            cpus: 4,
            ram_mb: 4096,
            partitions: vec![],
            attributes: Default::default(),
        }
    }

    /// Hands out one end of a duplex pipe on its first call, then fails —
    /// enough to exercise a single successful connect plus the post-shutdown
    /// reconnect attempt hitting a closed source.
    struct OneShotIo(AsyncMutex<Option<DuplexStream>>);

    #[tokio::test]
    async fn sends_hello_on_connect() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let slot = Arc::new(OneShotIo(AsyncMutex::new(Some(client_io))));

        let connector = Arc::new(FnConnector(move || {
            let slot = slot.clone();
            async move {
                match slot.0.lock().await.take() {
                    Some(io) => Ok(Box::new(io) as BoxedIo),
                    None => Err(CmError::new(ErrorKind::Failed, "no more test connections")),
                }
            }
        }));

        let (transport, mut events_rx) = CloudTransport::new(
            connector,
            Arc::new(test_node_info),
            8,
            Duration::from_secs(1),
        );
        let shutdown = transport.shutdown_token();

        let (incoming_tx, _incoming_rx) = mpsc::channel(8);

        let run_handle = tokio::spawn(async move { transport.run(incoming_tx).await });

        let mut server = FramedStream::new(server_io);
        let (_kind, envelope): (u8, Envelope<CloudMessage>) =
            server.read_json().await.unwrap().unwrap();
        assert!(matches!(envelope.payload, CloudMessage::Hello(_)));

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Connected));

        shutdown.cancel();
        let _ = run_handle.await;
    }
}
