//! Device server entry point.
//!
//! One process per configured binding:
//!
//! ```bash
//! dm-server --config /etc/dm-fleet/fleet.toml --server dm1
//! ```
//!
//! Startup is all-or-nothing: configuration, driver construction,
//! hardware initialization, and the default flat must all succeed before
//! the endpoint opens; no server runs half-initialized.

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
use dm_drivers::build_driver;
use dm_server::controller::MirrorController;
use dm_server::server;

#[derive(Parser)]
#[command(name = "dm-server", about = "Network control server for one wavefront-shaping device")]
struct Cli {
    /// Deployment configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Name of the server binding to run.
    #[arg(long)]
    server: String,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fleet = FleetConfig::load(&cli.config)?;
    let binding = fleet.binding(&cli.server)?.clone();
    init_tracing(&binding.log_level);

    let descriptor = fleet.descriptor_for(&binding)?;
    info!(
        server = %binding.name,
        mirror = %descriptor.name,
        model = %descriptor.model,
        "starting device server"
    );

    let driver = build_driver(descriptor, fleet.global.calibration_root.as_deref())?;
    let driver: Arc<dyn dm_drivers::DeformableMirror> = Arc::from(driver);
    driver
        .initialize()
        .await
        .with_context(|| format!("initializing '{}'", descriptor.name))?;

    let controller = Arc::new(
        MirrorController::new(
            binding.name.clone(),
            binding.busy_policy,
            descriptor.default_flat_tag.clone(),
            driver,
        )
        .await?,
    );
    if let Some(tag) = controller.apply_startup_flat().await? {
        info!(flat = %tag, "startup flat applied");
    }

    let listener = TcpListener::bind(binding.addr())
        .await
        .with_context(|| format!("binding {}", binding.addr()))?;
    info!(addr = %binding.addr(), "device server listening");

    server::run(listener, controller).await?;
    info!(server = %binding.name, "device server stopped");
    Ok(())
}
