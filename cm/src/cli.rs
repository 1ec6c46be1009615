//! Command-line surface. The config-file loader itself is
//! out of scope; `--config` only names the file `config::Config`
//! loads into.

use std::path::PathBuf;

use clap::Parser;

/// cm — node communication manager.
#[derive(Parser, Debug)]
#[command(name = "cm", version, about)]
pub struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "/etc/cm/config.toml")]
    pub config: PathBuf,

    /// Start in provisioning mode: wait for IAM to drive the node through
    /// `StartProvisioning`/`FinishProvisioning` before joining the fleet.
    #[arg(long)]
    pub provisioning: bool,

    /// Log to the systemd journal instead of stderr.
    #[arg(long)]
    pub journal: bool,

    /// Log verbosity, 0 (errors only) through 4 (trace).
    #[arg(long, default_value_t = 1)]
    pub verbose: u8,
}

impl Args {
    pub fn env_filter_directive(&self) -> &'static str {
        match self.verbose {
            0 => "cm=error,cm_reconciler=error,cm_transport=error,cm_iam=error,cm_images=error,cm_storagestate=error,cm_network=error,cm_monitor=error,warn",
            1 => "cm=info,cm_reconciler=info,cm_transport=info,cm_iam=info,cm_images=info,cm_storagestate=info,cm_network=info,cm_monitor=info,warn",
            2 => "cm=debug,cm_reconciler=debug,cm_transport=debug,cm_iam=debug,cm_images=debug,cm_storagestate=debug,cm_network=debug,cm_monitor=debug,info",
            3 => "cm=trace,cm_reconciler=debug,cm_transport=debug,cm_iam=debug,cm_images=debug,cm_storagestate=debug,cm_network=debug,cm_monitor=debug,debug",
            _ => "trace",
        }
    }
}
