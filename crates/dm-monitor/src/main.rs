//! Process monitor entry point.
//!
//! ```bash
//! dm-monitor --config /etc/dm-fleet/fleet.toml
//! ```
//!
//! Owns the lifecycle of every configured device server and answers
//! `startAll`/`stopAll`/`killAll`/`start`/`stop`/`status` on its own
//! endpoint.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dm_core::config::FleetConfig;
use dm_monitor::server;
use dm_monitor::Supervisor;

#[derive(Parser)]
#[command(name = "dm-monitor", about = "Lifecycle monitor for the dm-fleet device servers")]
struct Cli {
    /// Deployment configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Start every configured server immediately after binding.
    #[arg(long)]
    start_all: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let fleet = FleetConfig::load(&cli.config)?;
    let supervisor = Arc::new(Supervisor::new(&fleet, cli.config.clone()));

    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.liveness_loop().await });
    }

    if cli.start_all {
        info!("starting all configured device servers");
        supervisor.start_all().await;
    }

    let listener = TcpListener::bind(fleet.monitor.addr())
        .await
        .with_context(|| format!("binding {}", fleet.monitor.addr()))?;
    info!(addr = %fleet.monitor.addr(), servers = fleet.servers.len(), "process monitor listening");

    server::run(listener, supervisor).await?;
    info!("process monitor stopped");
    Ok(())
}
