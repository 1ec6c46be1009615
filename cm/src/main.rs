//! `cm` — node communication manager.
//! Wires components A-I together in dependency order and tears them down in
//! reverse on shutdown.

mod cli;
mod config;
mod connectors;
mod dispatch;
mod identity;
mod node_info;
mod provisioning;
mod registry_resolver;
mod supervisor;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cm_iam::{IamClient, NodeStateStore};
use cm_images::ImageService;
use cm_monitor::MonitoringForwarder;
use cm_network::{FileDnsResolver, NetworkManager, NetworkManagerConfig};
use cm_proto::{CmError, CmResult, ErrorKind};
use cm_reconciler::{Reconciler, ReconcilerConfig, SmRegistry};
use cm_storagestate::{SetquotaEnforcer, StorageStateSupervisor};
use cm_store::Store;
use cm_transport::{CloudTransport, SmChannel};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::Args;
use config::Config;
use connectors::TcpConnector;
use node_info::LiveNodeInfo;
use provisioning::PasswordGatedProvisioning;
use registry_resolver::RegistryUrlResolver;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!(error = %e, "fatal startup or runtime failure");
            Err(anyhow::anyhow!(e.to_string()))
        }
    }
}

fn init_tracing(args: &Args) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.env_filter_directive()));

    if args.journal {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry().with(filter).with(journald).init();
                return;
            }
            Err(e) => {
                // fall through to stderr; journald isn't always reachable
                // (containers without a socket mount, CI, ...).
                eprintln!("tracing-journald unavailable ({e}), logging to stderr instead");
            }
        }
    }
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

async fn run(args: Args) -> CmResult<()> {
    let config = Config::load(&args.config).await?;
    tokio::fs::create_dir_all(&config.working_dir).await?;

    let node_id = identity::load_or_create(&config.node_id_path).await?;
    info!(node_id = %node_id, provisioning = args.provisioning, "cm starting");

    let node_state = Arc::new(NodeStateStore::load(&config.provisioning_state_path)?);
    let store = Arc::new(Store::open(config.working_dir.join("cm.db")).await?);

    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new();

    if let Err(e) = start(&args, &config, node_id.clone(), node_state, store, shutdown.clone(), &mut supervisor).await
    {
        supervisor.unwind().await;
        return Err(e);
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();
    supervisor.shutdown().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start(
    args: &Args,
    config: &Config,
    node_id: cm_proto::domain::NodeId,
    node_state: Arc<NodeStateStore>,
    store: Arc<Store>,
    shutdown: CancellationToken,
    supervisor: &mut Supervisor,
) -> CmResult<()> {
    // B: Identity Agent client.
    let iam_actions = Arc::new(PasswordGatedProvisioning::new(config.provisioning_password.clone()));
    let iam_connector: Arc<dyn cm_transport::Connect> = Arc::new(TcpConnector { addr: config.iam_endpoint.clone() });
    let (iam_client, iam_events, _iam_notifications) =
        IamClient::new(iam_connector, iam_actions, node_state.clone(), config.iam_queue_capacity);
    let iam_client = Arc::new(iam_client);
    {
        let iam_client = iam_client.clone();
        tokio::spawn(async move { iam_client.run().await });
    }
    {
        let iam_client = iam_client.clone();
        tokio::spawn(dispatch::run_iam_connection_watcher(iam_events, iam_client, shutdown.clone()));
    }
    {
        let iam_client = iam_client.clone();
        supervisor.register("iam-client", move || async move { iam_client.stop() });
    }

    // C: Cloud Transport.
    let node_info_source: Arc<dyn cm_transport::NodeInfoSource> = Arc::new(LiveNodeInfo::new(
        node_id.clone(),
        config.node_type.clone(),
        num_cpus(),
        total_ram_mb(),
        node_state.clone(),
    ));
    let cloud_connector: Arc<dyn cm_transport::Connect> =
        Arc::new(TcpConnector { addr: config.cloud_endpoint.clone() });
    let (cloud, cloud_events) = CloudTransport::new(
        cloud_connector,
        node_info_source,
        config.cloud_queue_capacity,
        Duration::from_secs(config.enqueue_timeout_secs),
    );
    let cloud = Arc::new(cloud);
    let (cloud_incoming_tx, cloud_incoming_rx) = tokio::sync::mpsc::channel(config.cloud_queue_capacity);
    {
        let cloud = cloud.clone();
        tokio::spawn(async move { cloud.run(cloud_incoming_tx).await });
    }
    {
        let cloud = cloud.clone();
        supervisor.register("cloud-transport", move || async move { cloud.stop() });
    }

    // E: content-addressed image cache.
    let url_resolver: Arc<dyn cm_images::UrlResolver> =
        Arc::new(RegistryUrlResolver { base_url: config.registry_base_url.clone() });
    let images = Arc::new(
        ImageService::open(
            config.images_dir.clone(),
            config.download_capacity_bytes,
            config.install_capacity_bytes,
            url_resolver,
        )
        .await?,
    );

    // F: per-instance storage/state supervisor.
    let storagestate = Arc::new(StorageStateSupervisor::new(
        config.storage_root_dir.clone(),
        store.clone(),
        cloud.clone(),
        Arc::new(SetquotaEnforcer) as Arc<dyn cm_storagestate::QuotaEnforcer>,
    ));

    // G: network manager.
    let subnet_pool = config
        .subnet_pool
        .iter()
        .map(|s| {
            s.parse()
                .map_err(|e| CmError::wrap(ErrorKind::InvalidArgument, format!("parsing subnet {s}"), e))
        })
        .collect::<CmResult<Vec<ipnet::Ipv4Net>>>()?;
    let dns_resolver: Arc<dyn cm_network::DnsResolver> = Arc::new(FileDnsResolver {
        zone_path: config.dns_storage_path.clone(),
        reload_command: config.dns_reload_command.clone(),
    });
    let network = Arc::new(NetworkManager::new(
        store.clone(),
        NetworkManagerConfig { subnet_pool, dns_primary: config.dns_primary },
        Box::new(rand::rngs::OsRng),
        dns_resolver,
    ));

    // D: one channel per configured SM, registered into the shared registry
    // the reconciler and monitor both consult.
    let sm_registry = Arc::new(SmRegistry::new());

    // H: reconciler, built before the SM loop since each channel's dispatch
    // task needs a handle to it, but it only touches SMs through the shared
    // registry, so construction order here doesn't matter beyond that.
    let reconciler = Arc::new(Reconciler::new(
        node_id.clone(),
        store.clone(),
        images.clone(),
        storagestate.clone(),
        network.clone(),
        sm_registry.clone(),
        cloud.clone(),
        ReconcilerConfig { download_concurrency: config.download_concurrency, sm_deadline: Duration::from_secs(config.sm_deadline_secs) },
    ));
    // `Reconciler::run` takes the shared shutdown token directly rather than
    // owning one, so it needs no separate supervisor entry: cancelling
    // `shutdown` before `supervisor.shutdown()` runs already stops it.
    {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await });
    }

    // I: monitoring forwarder.
    let monitor = Arc::new(MonitoringForwarder::new(
        cloud.clone(),
        cm_monitor::MonitorConfig {
            average_window: config.monitor_average_window,
            alert_buffer_capacity: config.monitor_alert_buffer_capacity,
        },
    ));
    {
        let monitor = monitor.clone();
        tokio::spawn(async move { watch_cloud_reconnects(cloud_events, monitor).await });
    }

    for sm in &config.sm_endpoints {
        let connector: Arc<dyn cm_transport::Connect> = Arc::new(TcpConnector { addr: sm.endpoint.clone() });
        let (channel, events) = SmChannel::new(sm.sm_node_id.clone(), connector, config.sm_queue_capacity);
        let channel = Arc::new(channel);
        sm_registry.register(sm.sm_node_id.clone(), channel.clone()).await;

        let (sm_incoming_tx, sm_incoming_rx) = tokio::sync::mpsc::channel(config.sm_queue_capacity);
        {
            let channel = channel.clone();
            tokio::spawn(async move { channel.run(sm_incoming_tx).await });
        }
        tokio::spawn(dispatch::run_sm_dispatch(
            sm.sm_node_id.clone(),
            sm_incoming_rx,
            channel.clone(),
            sm_registry.clone(),
            reconciler.clone(),
            monitor.clone(),
            images.clone(),
            shutdown.clone(),
        ));
        {
            let reconciler = reconciler.clone();
            let sm_id = sm.sm_node_id.clone();
            tokio::spawn(async move { watch_sm_reconnects(sm_id, events, reconciler).await });
        }
        {
            let channel = channel.clone();
            let registry = sm_registry.clone();
            let name = format!("sm-channel-{}", sm.sm_node_id);
            let sm_id = sm.sm_node_id.clone();
            supervisor.register(name, move || async move {
                channel.stop();
                registry.unregister(&sm_id).await;
            });
        }
    }

    tokio::spawn(dispatch::run_cloud_dispatch(
        cloud_incoming_rx,
        reconciler.clone(),
        storagestate.clone(),
        shutdown.clone(),
    ));

    if args.provisioning {
        info!("started in provisioning mode, awaiting IAM-driven StartProvisioning/FinishProvisioning");
    }

    Ok(())
}

/// Flushes any alerts buffered during a cloud outage each time it
/// reconnects.
async fn watch_cloud_reconnects(
    mut events: tokio::sync::mpsc::Receiver<cm_transport::CloudConnectionEvent>,
    monitor: Arc<MonitoringForwarder>,
) {
    while let Some(event) = events.recv().await {
        if matches!(event, cm_transport::CloudConnectionEvent::Connected) {
            monitor.flush_alerts().await;
        }
    }
}

/// Reissues an SM's outstanding delta each time it reconnects.
async fn watch_sm_reconnects(
    sm_node_id: String,
    mut events: tokio::sync::mpsc::Receiver<cm_transport::SmConnectionEvent>,
    reconciler: Arc<Reconciler>,
) {
    while let Some(event) = events.recv().await {
        if matches!(event, cm_transport::SmConnectionEvent::Connected) {
            reconciler.reissue(&sm_node_id).await;
        }
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1) as u32
}

fn total_ram_mb() -> u64 {
    // Best-effort; a production build would read `/proc/meminfo`. Absent a
    // portable crate already in the dependency stack for this, 0 just means
    // "unknown" to the cloud side rather than a fabricated number.
    0
}

async fn wait_for_shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => warn!(error = %e, "failed to install ctrl-c handler, waiting forever"),
    }
}
