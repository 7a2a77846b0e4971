//! `tncsi`: CSI driver for TrueNAS iSCSI volumes.
//!
//! `tncsi controller` runs next to the external provisioner and resizer;
//! `tncsi node` runs privileged on every worker.  Both serve the identity
//! service on the same socket.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libcsi::backend::truenas::TruenasBackendFactory;
use libcsi::exec::BoxedExecutor;
use libcsi::proto::ProbeRequest;
use libcsi::transport::{self, CsiClient, Role};
use libcsi::{
    ControllerService, HostExecutor, IdentityService, LinuxMounter, NodeService, PLUGIN_NAME,
    PLUGIN_VERSION, SessionManager, SysfsRegistry,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, LogFormat, NodeArgs};

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "unable to listen for SIGTERM, waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "unable to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
    }
    info!("shutdown requested");
}

fn node_role(args: &NodeArgs) -> Role {
    let executor: BoxedExecutor = HostExecutor::new();
    let registry = Arc::new(SysfsRegistry::new(&args.sysfs_root));
    let sessions = SessionManager::new(Arc::clone(&executor), registry);
    let mounter = Arc::new(LinuxMounter::new(executor));
    let service = NodeService::new(
        args.node_id.clone(),
        Arc::new(TruenasBackendFactory),
        Arc::new(sessions),
        mounter,
    )
    .with_settings(args.settings());
    Role::Node(service)
}

async fn probe(endpoint: &str) -> Result<()> {
    let path = transport::parse_endpoint(endpoint)?;
    let client = CsiClient::connect(&path).await?;
    let ready = client
        .identity()
        .probe(ProbeRequest {})
        .await
        .context("probe failed")?
        .into_inner()
        .ready
        .is_some_and(|ready| ready.value);
    if !ready {
        bail!("driver at {} is not ready", path.display());
    }
    println!("ready");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let role = match &cli.command {
        Command::Version => {
            println!("{PLUGIN_NAME} {PLUGIN_VERSION}");
            return Ok(());
        }
        Command::Probe => return probe(&cli.endpoint).await,
        Command::Controller => {
            Role::Controller(ControllerService::new(Arc::new(TruenasBackendFactory)))
        }
        Command::Node(args) => node_role(args),
    };

    let path = transport::parse_endpoint(&cli.endpoint)?;
    info!(name = PLUGIN_NAME, version = PLUGIN_VERSION, "starting csi driver");
    transport::serve(&path, IdentityService::new(), role, shutdown_signal())
        .await
        .with_context(|| format!("serving on {}", path.display()))
}
