//! Command line configuration.
//!
//! Every option can also be given through the environment, which is how the
//! driver is configured when deployed as a DaemonSet or Deployment.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use libcsi::node::NodeSettings;
use libcsi::poll::PollPolicy;
use libcsi::{DEFAULT_FS_TYPE, SUPPORTED_FS_TYPES};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tncsi", version, about = "CSI driver for TrueNAS iSCSI volumes")]
pub struct Cli {
    /// CSI socket endpoint (format: "unix://<path>")
    #[arg(
        long,
        env = "CSI_ENDPOINT",
        default_value = "unix:///csi/csi.sock",
        global = true
    )]
    pub endpoint: String,

    /// Turn verbose logging on
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the identity and controller services
    Controller,
    /// Serve the identity and node services
    Node(NodeArgs),
    /// Ask a running driver whether it is ready; fails unless it is
    Probe,
    /// Print plugin name and version
    Version,
}

#[derive(Args, Debug)]
pub struct NodeArgs {
    /// Name of this node as known to the orchestrator
    #[arg(long, env = "KUBE_NODE_NAME")]
    pub node_id: String,

    /// Mount point of the host's sysfs
    #[arg(long, env = "TNCSI_SYSFS_ROOT", default_value = "/sys", value_name = "DIR")]
    pub sysfs_root: PathBuf,

    /// How long to wait for the device after an iSCSI login
    #[arg(long, default_value_t = 10_000, value_name = "MS")]
    pub device_wait_timeout: u64,

    /// How often to check for the device while waiting
    #[arg(long, default_value_t = 200, value_name = "MS")]
    pub device_wait_interval: u64,

    /// Filesystem for blank volumes when the request names none
    #[arg(long, default_value = DEFAULT_FS_TYPE, value_parser = parse_fs_type)]
    pub fs_type: String,
}

impl NodeArgs {
    pub fn settings(&self) -> NodeSettings {
        NodeSettings {
            fs_type: self.fs_type.clone(),
            device_wait: PollPolicy::new(
                Duration::from_millis(self.device_wait_interval),
                Duration::from_millis(self.device_wait_timeout),
            ),
            ..NodeSettings::default()
        }
    }
}

fn parse_fs_type(value: &str) -> Result<String, String> {
    if SUPPORTED_FS_TYPES.contains(&value) {
        Ok(value.to_owned())
    } else {
        Err(format!("expected one of {}", SUPPORTED_FS_TYPES.join(", ")))
    }
}
