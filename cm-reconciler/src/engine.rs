//! The Reconciler: the `noUpdate -> downloading -> ready ->
//! installing -> noUpdate` state machine driving desired state to the SMs.
//!
//! `plan.rs` supplies the pure diffing; this module owns the I/O — talking
//! to the store, the image service, the storage/state supervisor, the
//! network manager, the SM registry and the cloud transport — and the
//! single-threaded actor loop that totally orders transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cm_proto::cloud::{CloudMessage, UnitStatusMessage};
use cm_proto::domain::{
    DesiredStatus, InstanceIdent, InstanceInfo, InstanceRunState, InstanceState,
    InstanceStatusReport, NodeId, UpdateItem, UpdateItemState, UpdateItemType, UpdateState,
};
use cm_proto::sm::{InstanceStatus, SmMessage, UpdateInstances};
use cm_proto::{CmResult, ErrorKind};
use cm_network::{NetworkManager, ServiceNetworkData};
use cm_images::ImageService;
use cm_storagestate::{SetupParams, StorageStateSupervisor};
use cm_store::Store;
use cm_transport::CloudTransport;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::plan::{self, SmDelta};
use crate::registry::SmRegistry;

pub struct ReconcilerConfig {
    /// Bounds parallel `ImageService::install` calls.
    pub download_concurrency: usize,
    /// Deadline for one SM's `UpdateInstances` round-trip.
    pub sm_deadline: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            sm_deadline: Duration::from_secs(30),
        }
    }
}

pub struct Reconciler {
    node_id: NodeId,
    store: Arc<Store>,
    images: Arc<ImageService>,
    storagestate: Arc<StorageStateSupervisor>,
    network: Arc<NetworkManager>,
    sms: Arc<SmRegistry>,
    cloud: Arc<CloudTransport>,
    config: ReconcilerConfig,
    pending_desired: Mutex<Option<DesiredStatus>>,
    wake: Notify,
    /// Per-SM delta from the last `installing` round, kept so a
    /// reconnecting SM can be reissued its outstanding work without
    /// disturbing any other SM.
    outstanding: Mutex<HashMap<String, SmDelta>>,
    /// Instances whose most recent reported run state is `failed`; consulted
    /// so a replacement isn't promoted to active before a later round.
    failed_instances: Mutex<HashMap<InstanceIdent, ()>>,
    latest_reports: Mutex<HashMap<InstanceIdent, InstanceStatusReport>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        store: Arc<Store>,
        images: Arc<ImageService>,
        storagestate: Arc<StorageStateSupervisor>,
        network: Arc<NetworkManager>,
        sms: Arc<SmRegistry>,
        cloud: Arc<CloudTransport>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            node_id,
            store,
            images,
            storagestate,
            network,
            sms,
            cloud,
            config,
            pending_desired: Mutex::new(None),
            wake: Notify::new(),
            outstanding: Mutex::new(HashMap::new()),
            failed_instances: Mutex::new(HashMap::new()),
            latest_reports: Mutex::new(HashMap::new()),
        }
    }

    /// Queues a `DesiredStatus` for the next quiescent point. A run already
    /// in flight is never preempted; a status arriving mid-run replaces any
    /// previously queued one.
    pub async fn submit_desired_status(&self, desired: DesiredStatus) {
        *self.pending_desired.lock().await = Some(desired);
        self.wake.notify_one();
    }

    /// Folds an `InstanceStatus` push from an SM into the in-memory report
    /// table the next `UnitStatus` snapshot is built from, and persists the
    /// instance's run state for invariant 1 bookkeeping.
    pub async fn handle_instance_status(&self, status: InstanceStatus) {
        if matches!(status.state, InstanceRunState::Failed) {
            self.failed_instances.lock().await.insert(status.ident.clone(), ());
        } else {
            self.failed_instances.lock().await.remove(&status.ident);
        }

        self.latest_reports.lock().await.insert(
            status.ident.clone(),
            InstanceStatusReport {
                ident: status.ident,
                state: status.state,
                message: status.message,
            },
        );
    }

    /// Resends an SM's last `UpdateInstances` delta after it reconnects
    ///. A no-op if this SM has no outstanding work.
    pub async fn reissue(&self, sm_node_id: &str) {
        let delta = self.outstanding.lock().await.get(sm_node_id).cloned();
        if let Some(delta) = delta {
            if let Err(e) = self.send_delta_to_sm(sm_node_id, &delta).await {
                warn!(sm = sm_node_id, error = %e, "failed to reissue outstanding delta");
            }
        }
    }

    /// Drives the state machine until `shutdown` fires. Each iteration waits
    /// for a queued `DesiredStatus`, then runs it to quiescence before
    /// looking for the next one.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let desired = self.pending_desired.lock().await.take();
            match desired {
                Some(desired) => {
                    if let Err(e) = self.run_round(desired).await {
                        warn!(error = %e, "reconciliation round failed");
                        let _ = self.store.set_update_state(UpdateState::NoUpdate).await;
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Runs one full `downloading -> ready -> installing -> noUpdate`
    /// round for `desired`.
    async fn run_round(&self, desired: DesiredStatus) -> CmResult<()> {
        self.store.set_update_state(UpdateState::Downloading).await?;

        let current_items = self.store.list_update_items().await?;
        let item_plan = plan::diff_items(&desired.items, &current_items);
        let failed_items = self.install_items(&item_plan.install).await;
        for item in &item_plan.remove {
            self.images.remove(&item.index_digest).await.ok();
            self.store.remove_update_item(&item.item_id, &item.version).await.ok();
        }

        self.store.set_update_state(UpdateState::Ready).await?;

        self.install_instances(&desired, &failed_items).await?;

        let sm_runtimes = self.sms.runtimes_by_sm().await;
        self.store.set_update_state(UpdateState::Installing).await?;
        let diff = plan::diff_instances(&desired.instances, &current_instances(&self.store).await?, &self.node_id, &sm_runtimes);

        self.apply_instance_diff(&diff).await;
        self.teardown_removed(&diff.removed).await;

        for ident in &diff.unroutable {
            self.latest_reports.lock().await.insert(
                ident.clone(),
                InstanceStatusReport {
                    ident: ident.clone(),
                    state: InstanceRunState::Failed,
                    message: Some("no SM advertises a matching runtime".into()),
                },
            );
        }

        self.store.set_update_state(UpdateState::NoUpdate).await?;
        self.store.set_desired_status(&desired).await?;
        self.emit_unit_status(&desired).await?;
        Ok(())
    }

    /// Installs every planned item, bounded by `download_concurrency`
    ///. Per-item failures are swallowed here; the returned set lets `install_instances` skip instances
    /// that depend on a failed item.
    async fn install_items(&self, install: &[UpdateItem]) -> std::collections::HashSet<String> {
        let semaphore = Arc::new(Semaphore::new(self.config.download_concurrency.max(1)));
        let mut set = tokio::task::JoinSet::new();
        for item in install.iter().cloned() {
            let semaphore = semaphore.clone();
            let images = self.images.clone();
            let store = self.store.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let digest = item.index_digest.clone();
                let result = images.install(&item, &digest, 0).await;
                match &result {
                    Ok(_) => {
                        let _ = store.add_update_item(&item).await;
                        let _ = store
                            .update_update_item_state(&item.item_id, &item.version, UpdateItemState::Installed)
                            .await;
                    }
                    Err(e) => {
                        warn!(item = %item.item_id, version = %item.version, error = %e, "item install failed");
                    }
                }
                (item.item_id, result.is_err())
            });
        }

        let mut failed = std::collections::HashSet::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((item_id, is_failed)) = joined {
                if is_failed {
                    failed.insert(item_id);
                }
            }
        }
        failed
    }

    /// Prepares storage, state and network plumbing for every instance
    /// targeting this node before it is handed to an SM.
    async fn install_instances(
        &self,
        desired: &DesiredStatus,
        failed_items: &std::collections::HashSet<String>,
    ) -> CmResult<()> {
        for instance in &desired.instances {
            if instance.target_node != self.node_id || failed_items.contains(&instance.ident.item_id) {
                continue;
            }

            if instance.storage_quota > 0 || instance.state_quota > 0 {
                self.storagestate
                    .setup(SetupParams {
                        ident: instance.ident.clone(),
                        uid: instance.uid,
                        gid: instance.gid,
                        storage_quota: instance.storage_quota,
                        state_quota: instance.state_quota,
                    })
                    .await?;
            }

            if let Some(network_id) = &instance.network_id {
                let service_data = ServiceNetworkData {
                    item_id: instance.ident.item_id.clone(),
                    exposed_ports: instance.exposed_ports.clone(),
                    allowed_connections: instance.allowed_connections.clone(),
                };
                self.network
                    .prepare_instance_network_parameters(&instance.ident, network_id, &self.node_id, &service_data)
                    .await?;
            }
        }
        Ok(())
    }

    /// Sends each SM its `stop[]`/`start[]` delta, skipping a start whose
    /// predecessor is currently `failed`.
    async fn apply_instance_diff(&self, diff: &plan::InstanceDiff) {
        let failed = self.failed_instances.lock().await.clone();
        let mut tasks = tokio::task::JoinSet::new();
        for (sm_id, delta) in diff.per_sm.clone() {
            let mut delta = delta;
            delta.start.retain(|info| !failed.contains_key(&info.ident));

            self.outstanding.lock().await.insert(sm_id.clone(), delta.clone());
            let this_sms = self.sms.clone();
            let deadline = self.config.sm_deadline;
            tasks.spawn(async move {
                let channel = this_sms.channel(&sm_id).await;
                let outcome = match channel {
                    Some(channel) => {
                        channel
                            .call(
                                SmMessage::UpdateInstances(UpdateInstances {
                                    stop: delta.stop.clone(),
                                    start: delta.start.clone(),
                                }),
                                deadline,
                            )
                            .await
                            .map(|_| ())
                    }
                    None => Err(cm_proto::CmError::new(
                        ErrorKind::NotFound,
                        format!("sm {sm_id} is not currently connected"),
                    )),
                };
                (sm_id, delta, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((sm_id, delta, outcome)) = joined else { continue };
            match outcome {
                Ok(()) => {
                    for info in &delta.start {
                        let _ = self.store.add_instance(info).await;
                        let _ = self
                            .store
                            .set_instance_state(&info.ident, &info.version, InstanceState::Active)
                            .await;
                    }
                }
                Err(e) => {
                    warn!(sm = sm_id, error = %e, "sm update-instances round failed, will reissue on reconnect");
                    for info in &delta.start {
                        self.latest_reports.lock().await.insert(
                            info.ident.clone(),
                            InstanceStatusReport {
                                ident: info.ident.clone(),
                                state: InstanceRunState::Failed,
                                message: Some(e.to_string()),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Tears down storage/state/network records for instances with no
    /// desired entry left at all this round.
    async fn teardown_removed(&self, removed: &[InstanceIdent]) {
        for ident in removed {
            self.storagestate.remove(ident).await.ok();
            self.network.remove_instance_network_parameters(ident, &self.node_id).await.ok();
            self.latest_reports.lock().await.remove(ident);
            self.failed_instances.lock().await.remove(ident);
        }
    }

    async fn send_delta_to_sm(&self, sm_id: &str, delta: &SmDelta) -> CmResult<()> {
        let channel = self
            .sms
            .channel(sm_id)
            .await
            .ok_or_else(|| cm_proto::CmError::new(ErrorKind::NotFound, format!("sm {sm_id} not connected")))?;
        channel
            .call(
                SmMessage::UpdateInstances(UpdateInstances {
                    stop: delta.stop.clone(),
                    start: delta.start.clone(),
                }),
                self.config.sm_deadline,
            )
            .await
            .map(|_| ())
    }

    /// Builds and sends the upstream `UnitStatus` snapshot.
    async fn emit_unit_status(&self, desired: &DesiredStatus) -> CmResult<()> {
        let items = self.store.list_update_items().await?;
        let (services, layers, components): (Vec<_>, Vec<_>, Vec<_>) = partition_items(items);
        let reports: Vec<InstanceStatusReport> = self.latest_reports.lock().await.values().cloned().collect();

        let message = UnitStatusMessage {
            nodes: desired.nodes.clone(),
            services,
            layers,
            components,
            instances: reports,
            unit_config: desired.unit_config.clone(),
        };
        self.cloud.send(CloudMessage::UnitStatus(message)).await
    }
}

async fn current_instances(store: &Store) -> CmResult<Vec<InstanceInfo>> {
    store.list_instances().await
}

fn partition_items(items: Vec<UpdateItem>) -> (Vec<UpdateItem>, Vec<UpdateItem>, Vec<UpdateItem>) {
    let mut services = Vec::new();
    let mut layers = Vec::new();
    let mut components = Vec::new();
    for item in items {
        match item.item_type {
            UpdateItemType::Service => services.push(item),
            UpdateItemType::Layer => layers.push(item),
            UpdateItemType::Component => components.push(item),
        }
    }
    (services, layers, components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_proto::domain::NodeState;
    use cm_transport::{BoxedIo, FnConnector};

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

    fn dummy_cloud() -> Arc<CloudTransport> {
        let connector = Arc::new(FnConnector(|| async {
            Err::<BoxedIo, _>(cm_proto::CmError::new(ErrorKind::Failed, "no network in tests"))
        }));
        let (transport, _events) =
            CloudTransport::new(connector, Arc::new(test_node_info), 8, Duration::from_millis(10));
        Arc::new(transport)
    }

    async fn test_reconciler() -> (Reconciler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let images = Arc::new(
            ImageService::open(dir.path().join("images"), 10_000_000, 10_000_000, Arc::new(NoResolver))
                .await
                .unwrap(),
        );
        let cloud = dummy_cloud();
        let storagestate =
            Arc::new(StorageStateSupervisor::new(dir.path().join("storagestate"), store.clone(), cloud.clone(), Arc::new(NoopQuota)));
        let network = Arc::new(NetworkManager::new(
            store.clone(),
            cm_network::NetworkManagerConfig {
                subnet_pool: vec!["10.10.0.0/16".parse().unwrap()],
                dns_primary: "10.10.0.1".parse().unwrap(),
            },
            Box::new(rand::rngs::OsRng),
            Arc::new(NoopDns),
        ));
        let reconciler = Reconciler::new(
            NodeId("node-1".into()),
            store,
            images,
            storagestate,
            network,
            Arc::new(SmRegistry::new()),
            cloud,
            ReconcilerConfig::default(),
        );
        (reconciler, dir)
    }

    struct NoResolver;
    #[async_trait::async_trait]
    impl cm_images::UrlResolver for NoResolver {
        async fn resolve(&self, _digest: &str) -> CmResult<String> {
            Err(cm_proto::CmError::new(ErrorKind::NotFound, "no resolver in this test"))
        }
    }

    #[derive(Default)]
    struct NoopQuota;
    #[async_trait::async_trait]
    impl cm_storagestate::QuotaEnforcer for NoopQuota {
        async fn set_user_quota(&self, _path: &std::path::Path, _uid: u32, _bytes: u64) -> CmResult<()> {
            Ok(())
        }
    }

    struct NoopDns;
    #[async_trait::async_trait]
    impl cm_network::DnsResolver for NoopDns {
        async fn reload(&self, _zone: &str) -> CmResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_round_reaches_no_update_and_persists_desired_status() {
        let (reconciler, _dir) = test_reconciler().await;
        let desired = DesiredStatus::default();
        reconciler.run_round(desired.clone()).await.unwrap();
        assert_eq!(reconciler.store.get_update_state().await.unwrap(), UpdateState::NoUpdate);
        assert!(reconciler.store.get_desired_status().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unroutable_instance_is_reported_failed() {
        let (reconciler, _dir) = test_reconciler().await;
        let mut desired = DesiredStatus::default();
        desired.instances.push(InstanceInfo {
            ident: InstanceIdent { item_id: "svcA".into(), subject_id: "sub".into(), instance: 0 },
            version: "1".into(),
            manifest_digest: "sha256:x".into(),
            runtime: "docker".into(),
            target_node: NodeId("node-1".into()),
            uid: 1000,
            gid: 1000,
            priority: 0,
            labels: vec![],
            env: Default::default(),
            network_id: None,
            exposed_ports: vec![],
            allowed_connections: vec![],
            monitoring_thresholds: None,
            state: InstanceState::Active,
            storage_quota: 0,
            state_quota: 0,
        });

        reconciler.run_round(desired).await.unwrap();
        let reports = reconciler.latest_reports.lock().await;
        let report = reports.values().next().unwrap();
        assert_eq!(report.state, InstanceRunState::Failed);
    }
}
