//! Command relay - HTTP front end for sending commands to devices
//!
//! Accepts `{device_id, remote, name, duration}` over HTTP and delivers it
//! to the device through the registry API under the `signal` subfolder.

use clap::Parser;
use cloud_iot_agent::config::RelayConfig;
use cloud_iot_agent::observability::init_default_logging;
use cloud_iot_agent::relay::{serve, CloudIotCommandSender, CommandSender};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// HTTP relay that forwards remote-control commands to devices
#[derive(Parser)]
#[command(name = "command-relay")]
#[command(about = "Relay remote-control commands to devices through the registry API")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_default_logging();

    if let Err(e) = run(args).await {
        error!("Command relay failed: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", args.config.display());
    let config = RelayConfig::load_from_file(&args.config)?;

    let addr = match args.listen {
        Some(addr) => addr,
        None => config.relay.listen_addr.parse()?,
    };

    let sender: Arc<dyn CommandSender> = Arc::new(CloudIotCommandSender::from_config(&config)?);
    info!(
        project_id = %config.registry.project_id,
        registry_id = %config.registry.registry_id,
        "Command relay configured"
    );

    serve(addr, sender, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = signal::ctrl_c().await;
        }
    }
}
