//! Typed configuration loaded from the TOML file named by `--config`. Every field has a production-sane
//! default so a missing config file still boots the daemon against
//! localhost endpoints rather than hard-failing on a missing file.

use std::net::IpAddr;
use std::path::PathBuf;

use cm_proto::{CmError, CmResult, ErrorKind};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_type: String,
    pub node_id_path: PathBuf,
    pub provisioning_state_path: PathBuf,
    pub working_dir: PathBuf,
    pub storage_root_dir: PathBuf,
    pub images_dir: PathBuf,
    pub dns_storage_path: PathBuf,

    pub cloud_endpoint: String,
    pub iam_endpoint: String,
    pub sm_endpoints: Vec<SmEndpoint>,

    pub cloud_queue_capacity: usize,
    pub iam_queue_capacity: usize,
    pub sm_queue_capacity: usize,
    pub enqueue_timeout_secs: u64,
    pub sm_deadline_secs: u64,

    pub download_concurrency: usize,
    pub download_capacity_bytes: u64,
    pub install_capacity_bytes: u64,
    pub registry_base_url: String,

    pub subnet_pool: Vec<String>,
    pub dns_primary: IpAddr,
    pub dns_reload_command: Vec<String>,

    /// Fallback provisioning password checked by the in-process
    /// `ProvisioningActions` when no external PKCS#11-backed agent is wired
    /// in.
    pub provisioning_password: String,

    pub monitor_average_window: usize,
    pub monitor_alert_buffer_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmEndpoint {
    pub sm_node_id: String,
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_type: "edge".into(),
            node_id_path: "/var/lib/cm/node-id".into(),
            provisioning_state_path: "/var/lib/cm/provisioning-state".into(),
            working_dir: "/var/lib/cm".into(),
            storage_root_dir: "/var/lib/cm/instances".into(),
            images_dir: "/var/lib/cm/images".into(),
            dns_storage_path: "/var/lib/cm/dns/hosts".into(),

            cloud_endpoint: "127.0.0.1:9443".into(),
            iam_endpoint: "127.0.0.1:9444".into(),
            sm_endpoints: Vec::new(),

            cloud_queue_capacity: 256,
            iam_queue_capacity: 64,
            sm_queue_capacity: 128,
            enqueue_timeout_secs: 10,
            sm_deadline_secs: 30,

            download_concurrency: 4,
            download_capacity_bytes: 10 * 1024 * 1024 * 1024,
            install_capacity_bytes: 10 * 1024 * 1024 * 1024,
            registry_base_url: "https://registry.invalid/blobs".into(),

            subnet_pool: vec!["10.200.0.0/16".into()],
            dns_primary: IpAddr::from([127, 0, 0, 1]),
            dns_reload_command: vec!["true".into()],

            provisioning_password: "admin".into(),

            monitor_average_window: 12,
            monitor_alert_buffer_capacity: 256,
        }
    }
}

impl Config {
    /// Loads `path` if it exists; a missing file falls back to defaults,
    /// since this is deliberately the minimal `toml`+`serde` shape layered
    /// under the `clap::Parser` flags in `cli`.
    pub async fn load(path: &std::path::Path) -> CmResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| CmError::wrap(ErrorKind::InvalidArgument, format!("parsing {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(CmError::wrap(ErrorKind::Failed, format!("reading {}", path.display()), e)),
        }
    }
}
