//! SM Channel: one stream per registered worker, carrying both
//! fire-and-forget pushes (monitoring, alerts, status) and request/response
//! exchanges (`UpdateInstances`, log requests, image content requests)
//! correlated by the envelope's `correlation_id`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cm_proto::envelope::{Envelope, StreamKind};
use cm_proto::sm::SmMessage;
use cm_proto::{CmError, CmResult, ErrorKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::connector::Connect;
use crate::framing::FramedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

type PendingReplies = Mutex<HashMap<String, oneshot::Sender<SmMessage>>>;

pub struct SmChannel {
    sm_node_id: String,
    connector: Arc<dyn Connect>,
    outbound_tx: mpsc::Sender<Envelope<SmMessage>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Envelope<SmMessage>>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    pending: PendingReplies,
    shutdown: CancellationToken,
}

impl SmChannel {
    pub fn new(
        sm_node_id: impl Into<String>,
        connector: Arc<dyn Connect>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(16);

        let this = Self {
            sm_node_id: sm_node_id.into(),
            connector,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events_tx,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        (this, events_rx)
    }

    pub fn sm_node_id(&self) -> &str {
        &self.sm_node_id
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Sends a message with no reply expected (monitoring acks, pushes).
    pub async fn send(&self, message: SmMessage) -> CmResult<()> {
        let envelope = Envelope::new(message_type_of(&message), message);
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| CmError::new(ErrorKind::Failed, "sm channel outbound queue closed"))
    }

    /// Sends a request and awaits its correlated reply, failing with
    /// `eTimeout` if the SM doesn't answer within `deadline`.
    /// Disconnection of this SM's underlying connection fails only
    /// in-flight calls on this channel, never other SMs.
    pub async fn call(&self, message: SmMessage, deadline: Duration) -> CmResult<SmMessage> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(correlation_id.clone(), tx);

        let envelope =
            Envelope::with_correlation(message_type_of(&message), correlation_id.clone(), message);
        if self.outbound_tx.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&correlation_id);
            return Err(CmError::new(
                ErrorKind::Failed,
                "sm channel outbound queue closed",
            ));
        }

        let result = tokio::time::timeout(deadline, rx).await;
        self.pending.lock().await.remove(&correlation_id);
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CmError::new(
                ErrorKind::Failed,
                "sm channel reconnected before reply arrived",
            )),
            Err(_) => Err(CmError::timeout(format!(
                "sm {} did not reply within {:?}",
                self.sm_node_id, deadline
            ))),
        }
    }

    /// Runs the reconnect loop. Unsolicited/uncorrelated frames are
    /// forwarded to `incoming_tx`; frames whose `correlation_id` matches a
    /// pending `call` are routed to that caller instead.
    pub async fn run(&self, incoming_tx: mpsc::Sender<SmMessage>) {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("SmChannel::run called more than once");
        let mut backoff = Backoff::default();

        loop {
            if self.shutdown.is_cancelled() {
                self.fail_all_pending().await;
                return;
            }

            match self.connector.connect().await {
                Ok(io) => {
                    backoff.reset();
                    info!(sm = %self.sm_node_id, "sm channel connected");
                    let _ = self.events_tx.send(ConnectionEvent::Connected).await;

                    let mut stream = FramedStream::new(io);
                    self.pump(&mut stream, &mut outbound_rx, &incoming_tx).await;

                    self.fail_all_pending().await;
                    let _ = self.events_tx.send(ConnectionEvent::Disconnected).await;
                }
                Err(e) => {
                    debug!(sm = %self.sm_node_id, error = %e, "sm channel connect failed");
                }
            }

            if self.shutdown.is_cancelled() {
                return;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    async fn pump<S>(
        &self,
        stream: &mut FramedStream<S>,
        outbound_rx: &mut mpsc::Receiver<Envelope<SmMessage>>,
        incoming_tx: &mpsc::Sender<SmMessage>,
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
                            if let Err(e) = stream.write_json(StreamKind::Sm as u8, &envelope).await {
                                error!(sm = %self.sm_node_id, error = %e, "sm channel write failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = stream.read_json::<Envelope<SmMessage>>() => {
                    match incoming {
                        Ok(Some((_, envelope))) => self.dispatch(envelope, incoming_tx).await,
                        Ok(None) => {
                            info!(sm = %self.sm_node_id, "sm channel closed by peer");
                            return;
                        }
                        Err(e) => {
                            error!(sm = %self.sm_node_id, error = %e, "sm channel read failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope<SmMessage>, incoming_tx: &mpsc::Sender<SmMessage>) {
        if let Some(correlation_id) = &envelope.correlation_id {
            let waiter = self.pending.lock().await.remove(correlation_id);
            if let Some(tx) = waiter {
                let _ = tx.send(envelope.payload);
                return;
            }
        }
        if incoming_tx.send(envelope.payload).await.is_err() {
            warn!(sm = %self.sm_node_id, "incoming sm message dropped, no receiver");
        }
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx; // dropping the sender fails the matching `call`'s recv
        }
    }
}

fn message_type_of(message: &SmMessage) -> &'static str {
    match message {
        SmMessage::SmInfo(_) => "sm_info",
        SmMessage::NodeConfigStatus(_) => "node_config_status",
        SmMessage::InstanceStatus(_) => "instance_status",
        SmMessage::Monitoring(_) => "monitoring",
        SmMessage::Alert(_) => "alert",
        SmMessage::Log(_) => "log",
        SmMessage::ImageContentRequest(_) => "image_content_request",
        SmMessage::ImageContent(_) => "image_content",
        SmMessage::ImageContentInfo(_) => "image_content_info",
        SmMessage::UpdateInstances(_) => "update_instances",
        SmMessage::UpdateNetworks(_) => "update_networks",
        SmMessage::SystemLogRequest(_) => "system_log_request",
        SmMessage::InstanceLogRequest(_) => "instance_log_request",
        SmMessage::InstanceCrashLogRequest(_) => "instance_crash_log_request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{BoxedIo, FnConnector};
    use cm_proto::sm::{NodeConfigStatus, UpdateInstances};
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex as AsyncMutex;

    struct OneShotIo(AsyncMutex<Option<DuplexStream>>);

    #[tokio::test]
    async fn call_resolves_when_reply_correlation_matches() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let slot = Arc::new(OneShotIo(AsyncMutex::new(Some(client_io))));

        let connector = Arc::new(FnConnector(move || {
            let slot = slot.clone();
            async move {
                slot.0
                    .lock()
                    .await
                    .take()
                    .map(|io| Box::new(io) as BoxedIo)
                    .ok_or_else(|| CmError::new(ErrorKind::Failed, "no more test connections"))
            }
        }));

        let (channel, mut events_rx) = SmChannel::new("sm-1", connector, 8);
        let channel = Arc::new(channel);
        let shutdown = channel.shutdown_token();

        let (incoming_tx, _incoming_rx) = mpsc::channel(8);
        let run_channel = channel.clone();
        let run_handle = tokio::spawn(async move { run_channel.run(incoming_tx).await });

        assert_eq!(events_rx.recv().await, Some(ConnectionEvent::Connected));

        let mut server = FramedStream::new(server_io);
        let (_kind, request): (u8, Envelope<SmMessage>) =
            server.read_json().await.unwrap().unwrap();
        assert!(matches!(request.payload, SmMessage::UpdateInstances(_)));
        let correlation_id = request.correlation_id.clone().unwrap();

        let reply = Envelope::with_correlation(
            "node_config_status",
            correlation_id,
            SmMessage::NodeConfigStatus(NodeConfigStatus {
                node_id: "sm-1".into(),
                config_version: "v1".into(),
                error: None,
            }),
        );
        server.write_json(StreamKind::Sm as u8, &reply).await.unwrap();

        let response = channel
            .call(
                SmMessage::UpdateInstances(UpdateInstances {
                    stop: vec![],
                    start: vec![],
                }),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(matches!(response, SmMessage::NodeConfigStatus(_)));

        shutdown.cancel();
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn call_times_out_when_no_reply_arrives() {
        let (client_io, _server_io) = tokio::io::duplex(8192);
        let slot = Arc::new(OneShotIo(AsyncMutex::new(Some(client_io))));

        let connector = Arc::new(FnConnector(move || {
            let slot = slot.clone();
            async move {
                slot.0
                    .lock()
                    .await
                    .take()
                    .map(|io| Box::new(io) as BoxedIo)
                    .ok_or_else(|| CmError::new(ErrorKind::Failed, "no more test connections"))
            }
        }));

        let (channel, _events_rx) = SmChannel::new("sm-1", connector, 8);
        let channel = Arc::new(channel);
        let shutdown = channel.shutdown_token();
        let (incoming_tx, _incoming_rx) = mpsc::channel(8);
        let run_channel = channel.clone();
        let run_handle = tokio::spawn(async move { run_channel.run(incoming_tx).await });

        let err = channel
            .call(
                SmMessage::UpdateInstances(UpdateInstances {
                    stop: vec![],
                    start: vec![],
                }),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        shutdown.cancel();
        let _ = run_handle.await;
    }
}
