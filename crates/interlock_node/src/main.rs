//! interlock-node: runs one InterLock mesh server until Ctrl-C.

mod cli;
mod logging;
mod recorder;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use interlock::{MeshHandle, MeshTransport, PeerStatus};
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::recorder::TracingRecorder;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = cli.load_config()?;
    cli.apply_overrides(&mut config)?;
    config.validate()?;

    let guard = logging::init_logging(&cli.logs_dir()?, cli.verbose)?;

    let mut mesh = MeshTransport::new(config)
        .with_recorder(Arc::new(TracingRecorder))
        .await;

    if let Err(e) = mesh.start().await {
        error!("Failed to start mesh: {e}");
        drop(guard);
        std::process::exit(1);
    }

    let handle = mesh.handle();
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&handle).await,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    log_status(&handle).await;
    mesh.stop().await;
    Ok(())
}

async fn log_status(handle: &MeshHandle) {
    let status = handle.status().await;
    let count = |s: PeerStatus| status.peers.iter().filter(|p| p.status == s).count();
    info!(
        "{} [{}]: peers active={} inactive={} recovering={} unknown={}; signals accepted={} rejected={}; handler failures={}",
        status.server_name,
        status.state,
        count(PeerStatus::Active),
        count(PeerStatus::Inactive),
        count(PeerStatus::Recovering),
        count(PeerStatus::Unknown),
        status.tumbler.accepted,
        status.tumbler.rejected,
        status.handler_failures,
    );
}
