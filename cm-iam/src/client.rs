//! Streaming client to the local Identity Agent.
//!
//! IAM pushes provisioning requests down this stream (it drives the node's
//! provisioning state machine); the node sends its own requests up it for
//! system info, subjects and certificates. Both directions share one
//! `FramedStream`, correlated the same way as the SM channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cm_proto::envelope::{Envelope, StreamKind};
use cm_proto::iam::{
    Ack, ApplyCertResponse, CreateKeyResponse, GetCertTypesResponse, IamNotification, IamRequest,
    IamResponse,
};
use cm_proto::domain::NodeState;
use cm_proto::{CmError, CmResult, ErrorKind};
use cm_transport::{Connect, FramedStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::state::{check_transition, NodeStateStore};

/// Handles the provisioning actions IAM requests once the transition is
/// known to be legal. Implemented by the component that owns credential
/// material (out of scope here; spec treats cert/key material as opaque).
#[async_trait]
pub trait ProvisioningActions: Send + Sync {
    async fn start_provisioning(&self, password: &str) -> CmResult<()>;
    async fn finish_provisioning(&self, password: &str) -> CmResult<()>;
    async fn deprovision(&self, password: &str) -> CmResult<()>;
    async fn create_key(&self, cert_type: &str, subject: &str) -> CmResult<String>;
    async fn apply_cert(&self, cert_type: &str, cert: &str) -> CmResult<(String, Vec<u8>)>;
    async fn cert_types(&self) -> CmResult<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

type PendingReplies = Mutex<HashMap<String, oneshot::Sender<IamResponse>>>;

pub struct IamClient {
    connector: Arc<dyn Connect>,
    actions: Arc<dyn ProvisioningActions>,
    state: Arc<NodeStateStore>,
    outbound_tx: mpsc::Sender<Envelope<IamRequest>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Envelope<IamRequest>>>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    notifications_tx: mpsc::Sender<IamNotification>,
    pending: PendingReplies,
    shutdown: CancellationToken,
}

impl IamClient {
    pub fn new(
        connector: Arc<dyn Connect>,
        actions: Arc<dyn ProvisioningActions>,
        state: Arc<NodeStateStore>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>, mpsc::Receiver<IamNotification>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (notifications_tx, notifications_rx) = mpsc::channel(queue_capacity);

        let this = Self {
            connector,
            actions,
            state,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events_tx,
            notifications_tx,
            pending: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        (this, events_rx, notifications_rx)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Node-initiated request/response exchange (`GetSystemInfo`,
    /// `GetSubjects`, `GetCert`, `GetCertTypes`).
    pub async fn call(&self, request: IamRequest, deadline: Duration) -> CmResult<IamResponse> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id.clone(), tx);

        let envelope =
            Envelope::with_correlation(request_type_of(&request), correlation_id.clone(), request);
        if self.outbound_tx.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&correlation_id);
            return Err(CmError::new(ErrorKind::Failed, "iam client outbound queue closed"));
        }

        let result = tokio::time::timeout(deadline, rx).await;
        self.pending.lock().await.remove(&correlation_id);
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CmError::new(ErrorKind::Failed, "iam client reconnected before reply arrived")),
            Err(_) => Err(CmError::timeout("iam did not reply within deadline")),
        }
    }

    pub async fn run(&self) {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("IamClient::run called more than once");
        let mut backoff = cm_transport::Backoff::default();

        loop {
            if self.shutdown.is_cancelled() {
                self.fail_all_pending().await;
                return;
            }

            match self.connector.connect().await {
                Ok(io) => {
                    backoff.reset();
                    info!("iam client connected");
                    self.state.set_connected(true);
                    let _ = self.events_tx.send(ConnectionEvent::Connected).await;

                    let mut stream = FramedStream::new(io);
                    self.pump(&mut stream, &mut outbound_rx).await;

                    self.state.set_connected(false);
                    self.fail_all_pending().await;
                    let _ = self.events_tx.send(ConnectionEvent::Disconnected).await;
                }
                Err(e) => debug!(error = %e, "iam client connect failed"),
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

    async fn pump<S>(&self, stream: &mut FramedStream<S>, outbound_rx: &mut mpsc::Receiver<Envelope<IamRequest>>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(envelope) => {
                            let frame = IamFrame::Request(envelope);
                            if let Err(e) = stream.write_json(StreamKind::Iam as u8, &frame).await {
                                error!(error = %e, "iam client write failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = stream.read_json::<IamFrame>() => {
                    match incoming {
                        Ok(Some((_, frame))) => {
                            if self.handle_incoming(stream, frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            info!("iam client stream closed by peer");
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "iam client read failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Either a reply to one of our own `call`s, a pushed provisioning
    /// request, or an unsolicited notification.
    async fn handle_incoming<S>(&self, stream: &mut FramedStream<S>, frame: IamFrame) -> Result<(), ()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
    {
        match frame {
            IamFrame::Response(envelope) => {
                if let Some(correlation_id) = &envelope.correlation_id {
                    if let Some(tx) = self.pending.lock().await.remove(correlation_id) {
                        let _ = tx.send(envelope.payload);
                    }
                }
                Ok(())
            }
            IamFrame::Notification(notification) => {
                if self.notifications_tx.send(notification).await.is_err() {
                    warn!("iam notification dropped, no receiver");
                }
                Ok(())
            }
            IamFrame::Request(envelope) => {
                let response = self.process_request(envelope.payload).await;
                let response_type = response_type_of(&response);
                let reply = match envelope.correlation_id {
                    Some(id) => Envelope::with_correlation(response_type, id, response),
                    None => Envelope::new(response_type, response),
                };
                let frame = IamFrame::Response(reply);
                if let Err(e) = stream.write_json(StreamKind::Iam as u8, &frame).await {
                    error!(error = %e, "failed to send iam response");
                    return Err(());
                }
                Ok(())
            }
        }
    }

    /// Checks the node's current state against the transition table,
    /// delegates the actual provisioning work, then advances state only on
    /// success. A rejected transition replies with an error and never calls
    /// into `actions` or mutates state (matching `CheckCurrentNodeState`
    /// gating every `Process*` handler before delegating).
    async fn process_request(&self, request: IamRequest) -> IamResponse {
        match request {
            IamRequest::StartProvisioning(req) => {
                IamResponse::Ack(self.guarded(NodeState::Unprovisioned, None, || {
                    let actions = self.actions.clone();
                    let password = req.password.clone();
                    async move { actions.start_provisioning(&password).await }
                }).await)
            }
            IamRequest::FinishProvisioning(req) => {
                IamResponse::Ack(
                    self.guarded(NodeState::Unprovisioned, Some(NodeState::Provisioned), || {
                        let actions = self.actions.clone();
                        let password = req.password.clone();
                        async move { actions.finish_provisioning(&password).await }
                    })
                    .await,
                )
            }
            IamRequest::Deprovision(req) => {
                IamResponse::Ack(
                    self.guarded_any(
                        &[NodeState::Provisioned, NodeState::Paused],
                        Some(NodeState::Unprovisioned),
                        || {
                            let actions = self.actions.clone();
                            let password = req.password.clone();
                            async move { actions.deprovision(&password).await }
                        },
                    )
                    .await,
                )
            }
            IamRequest::PauseNode(_) => {
                IamResponse::Ack(
                    self.guarded(NodeState::Provisioned, Some(NodeState::Paused), || async { Ok(()) })
                        .await,
                )
            }
            IamRequest::ResumeNode(_) => {
                IamResponse::Ack(
                    self.guarded(NodeState::Paused, Some(NodeState::Provisioned), || async { Ok(()) })
                        .await,
                )
            }
            IamRequest::CreateKey(req) => match self.actions.create_key(&req.cert_type, &req.subject).await {
                Ok(csr) => IamResponse::CreateKey(CreateKeyResponse {
                    cert_type: req.cert_type,
                    csr,
                    error: None,
                }),
                Err(e) => IamResponse::CreateKey(CreateKeyResponse {
                    cert_type: req.cert_type,
                    csr: String::new(),
                    error: Some(e.to_string()),
                }),
            },
            IamRequest::ApplyCert(req) => match self.actions.apply_cert(&req.cert_type, &req.cert).await {
                Ok((cert_url, serial)) => IamResponse::ApplyCert(ApplyCertResponse {
                    cert_type: req.cert_type,
                    cert_url,
                    serial,
                    error: None,
                }),
                Err(e) => IamResponse::ApplyCert(ApplyCertResponse {
                    cert_type: req.cert_type,
                    cert_url: String::new(),
                    serial: Vec::new(),
                    error: Some(e.to_string()),
                }),
            },
            IamRequest::GetCertTypes(_) => match self.actions.cert_types().await {
                Ok(types) => IamResponse::GetCertTypes(GetCertTypesResponse { types, error: None }),
                Err(e) => IamResponse::GetCertTypes(GetCertTypesResponse {
                    types: Vec::new(),
                    error: Some(e.to_string()),
                }),
            },
            IamRequest::GetSystemInfo | IamRequest::GetSubjects | IamRequest::GetCert { .. } => {
                IamResponse::Ack(Ack {
                    error: Some("unexpected request direction".into()),
                })
            }
        }
    }

    async fn guarded<F, Fut>(&self, required: NodeState, advance_to: Option<NodeState>, action: F) -> Ack
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CmResult<()>>,
    {
        self.guarded_any(&[required], advance_to, action).await
    }

    async fn guarded_any<F, Fut>(&self, required: &[NodeState], advance_to: Option<NodeState>, action: F) -> Ack
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CmResult<()>>,
    {
        let current = self.state.current().state;
        if !required.contains(&current) {
            return Ack {
                error: Some(format!("wrong node state: {current:?}")),
            };
        }
        if let Some(target) = advance_to {
            if let Err(e) = check_transition(current, target) {
                return Ack { error: Some(e.to_string()) };
            }
        }

        match action().await {
            Ok(()) => {
                if let Some(target) = advance_to {
                    if let Err(e) = self.state.set_state(target) {
                        return Ack { error: Some(e.to_string()) };
                    }
                }
                Ack { error: None }
            }
            Err(e) => Ack { error: Some(e.to_string()) },
        }
    }

    async fn fail_all_pending(&self) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx;
        }
    }
}

/// Wire-level union: requests, responses and notifications share one
/// stream, distinguished by an explicit tag (kind-sniffing a bare
/// `Envelope<IamRequest>` against `Envelope<IamResponse>` is ambiguous —
/// several variant names, e.g. `create_key`, appear in both sets).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "frame")]
enum IamFrame {
    Request(Envelope<IamRequest>),
    Response(Envelope<IamResponse>),
    Notification(IamNotification),
}

fn request_type_of(request: &IamRequest) -> &'static str {
    match request {
        IamRequest::GetSystemInfo => "get_system_info",
        IamRequest::GetSubjects => "get_subjects",
        IamRequest::GetCert { .. } => "get_cert",
        IamRequest::StartProvisioning(_) => "start_provisioning",
        IamRequest::FinishProvisioning(_) => "finish_provisioning",
        IamRequest::Deprovision(_) => "deprovision",
        IamRequest::PauseNode(_) => "pause_node",
        IamRequest::ResumeNode(_) => "resume_node",
        IamRequest::CreateKey(_) => "create_key",
        IamRequest::ApplyCert(_) => "apply_cert",
        IamRequest::GetCertTypes(_) => "get_cert_types",
    }
}

fn response_type_of(response: &IamResponse) -> &'static str {
    match response {
        IamResponse::SystemInfo(_) => "system_info",
        IamResponse::Subjects(_) => "subjects",
        IamResponse::Cert(_) => "cert",
        IamResponse::Ack(_) => "ack",
        IamResponse::CreateKey(_) => "create_key",
        IamResponse::ApplyCert(_) => "apply_cert",
        IamResponse::GetCertTypes(_) => "get_cert_types",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::iam::{
        DeprovisionRequest, FinishProvisioningRequest, PauseNodeRequest, ResumeNodeRequest,
        StartProvisioningRequest,
    };
    use cm_transport::FnConnector;
    use tempfile::tempdir;

    struct PasswordGated(String);

    #[async_trait]
    impl ProvisioningActions for PasswordGated {
        async fn start_provisioning(&self, password: &str) -> CmResult<()> {
            self.check(password)
        }
        async fn finish_provisioning(&self, password: &str) -> CmResult<()> {
            self.check(password)
        }
        async fn deprovision(&self, password: &str) -> CmResult<()> {
            self.check(password)
        }
        async fn create_key(&self, _cert_type: &str, _subject: &str) -> CmResult<String> {
            Ok("csr".into())
        }
        async fn apply_cert(&self, _cert_type: &str, _cert: &str) -> CmResult<(String, Vec<u8>)> {
            Ok(("https://example/cert".into(), vec![1, 2, 3]))
        }
        async fn cert_types(&self) -> CmResult<Vec<String>> {
            Ok(vec!["node".into()])
        }
    }

    impl PasswordGated {
        fn check(&self, password: &str) -> CmResult<()> {
            if password == self.0 {
                Ok(())
            } else {
                Err(CmError::new(ErrorKind::InvalidArgument, "wrong password"))
            }
        }
    }

    fn client_with_state(state: Arc<NodeStateStore>) -> IamClient {
        let connector: Arc<dyn Connect> = Arc::new(FnConnector(|| async {
            CmResult::<cm_transport::BoxedIo>::Err(CmError::new(ErrorKind::Failed, "not dialed in this test"))
        }));
        let actions = Arc::new(PasswordGated("admin".to_string()));
        let (client, _events, _notifications) = IamClient::new(connector, actions, state, 16);
        client
    }

    #[tokio::test]
    async fn provisioning_happy_path() {
        let dir = tempdir().unwrap();
        let state = Arc::new(NodeStateStore::load(dir.path().join("state")).unwrap());
        let client = client_with_state(state.clone());
        assert_eq!(state.current().state, NodeState::Unprovisioned);

        let reply = client
            .process_request(IamRequest::StartProvisioning(StartProvisioningRequest {
                password: "admin".into(),
            }))
            .await;
        assert_eq!(reply, IamResponse::Ack(Ack { error: None }));
        assert_eq!(state.current().state, NodeState::Unprovisioned);

        let reply = client
            .process_request(IamRequest::FinishProvisioning(FinishProvisioningRequest {
                password: "admin".into(),
            }))
            .await;
        assert_eq!(reply, IamResponse::Ack(Ack { error: None }));
        assert_eq!(state.current().state, NodeState::Provisioned);
        assert_eq!(std::fs::read_to_string(dir.path().join("state")).unwrap(), "provisioned");
    }

    #[tokio::test]
    async fn finish_provisioning_rejects_wrong_password() {
        let dir = tempdir().unwrap();
        let state = Arc::new(NodeStateStore::load(dir.path().join("state")).unwrap());
        let client = client_with_state(state.clone());

        let reply = client
            .process_request(IamRequest::FinishProvisioning(FinishProvisioningRequest {
                password: "wrong".into(),
            }))
            .await;
        match reply {
            IamResponse::Ack(Ack { error: Some(_) }) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(state.current().state, NodeState::Unprovisioned);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let dir = tempdir().unwrap();
        let state = Arc::new(NodeStateStore::load(dir.path().join("state")).unwrap());
        state.set_state(NodeState::Provisioned).unwrap();
        let client = client_with_state(state.clone());

        let reply = client.process_request(IamRequest::PauseNode(PauseNodeRequest)).await;
        assert_eq!(reply, IamResponse::Ack(Ack { error: None }));
        assert_eq!(state.current().state, NodeState::Paused);

        let reply = client.process_request(IamRequest::ResumeNode(ResumeNodeRequest)).await;
        assert_eq!(reply, IamResponse::Ack(Ack { error: None }));
        assert_eq!(state.current().state, NodeState::Provisioned);
    }

    #[tokio::test]
    async fn pause_from_unprovisioned_is_rejected() {
        let dir = tempdir().unwrap();
        let state = Arc::new(NodeStateStore::load(dir.path().join("state")).unwrap());
        let client = client_with_state(state.clone());

        let reply = client.process_request(IamRequest::PauseNode(PauseNodeRequest)).await;
        match reply {
            IamResponse::Ack(Ack { error: Some(_) }) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(state.current().state, NodeState::Unprovisioned);
    }

    #[tokio::test]
    async fn deprovision_from_paused_returns_to_unprovisioned() {
        let dir = tempdir().unwrap();
        let state = Arc::new(NodeStateStore::load(dir.path().join("state")).unwrap());
        state.set_state(NodeState::Provisioned).unwrap();
        state.set_state(NodeState::Paused).unwrap();
        let client = client_with_state(state.clone());

        let reply = client
            .process_request(IamRequest::Deprovision(DeprovisionRequest {
                password: "admin".into(),
            }))
            .await;
        assert_eq!(reply, IamResponse::Ack(Ack { error: None }));
        assert_eq!(state.current().state, NodeState::Unprovisioned);
    }
}
