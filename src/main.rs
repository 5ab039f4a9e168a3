//! Cloud IoT device agent - Main Entry Point

use clap::{Parser, Subcommand};
use cloud_iot_agent::agent::{AgentLifecycle, CommandForwarder, CommandsHandler, StopReason};
use cloud_iot_agent::auth::CredentialMinter;
use cloud_iot_agent::config::AgentConfig;
use cloud_iot_agent::error::AgentError;
use cloud_iot_agent::observability::init_default_logging;
use cloud_iot_agent::routing::TopicHandler;
use cloud_iot_agent::transport::mqtt::{load_root_ca, MqttSession};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Device connectivity agent for a cloud IoT MQTT bridge
#[derive(Parser)]
#[command(name = "cloud-iot-agent")]
#[command(about = "Keeps one device connected to the cloud IoT bridge and forwards its commands")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGINT/SIGTERM or permanent connection loss
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var_os("LOG_LEVEL").is_none() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting cloud IoT agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        if e.is_fatal_at_startup() {
            error!(error = %e.sanitized(), "Agent cannot run");
        } else {
            error!(error = %e.sanitized(), "Command failed");
        }
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in ["agent.toml", "config/agent.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create agent.toml".into())
}

/// Wire the session, the forwarder and the lifecycle together
fn build_agent(config: AgentConfig) -> Result<AgentLifecycle<MqttSession>, AgentError> {
    let identity = config.identity()?;
    let minter = CredentialMinter::from_config(&config.auth, &identity)?;
    let root_ca = load_root_ca(config.mqtt.root_ca_path.as_deref())?;
    let session = MqttSession::new(identity, config.mqtt.clone(), minter, root_ca);

    let forwarder = CommandForwarder::new(&config.forwarder)?;
    let commands: Arc<dyn TopicHandler> = Arc::new(CommandsHandler::new(forwarder));

    Ok(AgentLifecycle::new(config, session, commands)?)
}

async fn run_agent(config: AgentConfig) -> Result<(), AgentError> {
    info!(device_id = %config.device.id, "Application starting");

    let mut agent = build_agent(config)?;

    if let Err(e) = agent.start().await {
        let error = AgentError::from(e);
        error!(error = %error.sanitized(), "Startup failed");
        if let Err(shutdown_err) = agent.shutdown().await {
            warn!("Error during shutdown: {}", shutdown_err);
        }
        return Err(error);
    }

    info!("Agent is running");

    match agent.run_until(wait_for_signal()).await? {
        StopReason::Signal(_) => Ok(()),
        StopReason::SignalSetup(reason) => Err(AgentError::internal(format!(
            "signal handlers unavailable: {reason}"
        ))),
        StopReason::SessionLost(reason) => Err(AgentError::connect(format!(
            "broker connection permanently lost: {reason}"
        ))),
    }
}

/// Resolves on SIGINT or SIGTERM, or at once if they cannot be watched
async fn wait_for_signal() -> StopReason {
    let handlers = signal::unix::signal(signal::unix::SignalKind::interrupt()).and_then(|sigint| {
        signal::unix::signal(signal::unix::SignalKind::terminate()).map(|sigterm| (sigint, sigterm))
    });

    let (mut sigint, mut sigterm) = match handlers {
        Ok(handlers) => handlers,
        Err(e) => return StopReason::SignalSetup(e.to_string()),
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            StopReason::Signal("SIGINT")
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            StopReason::Signal("SIGTERM")
        }
    }
}

fn handle_config_command(config: AgentConfig, show: bool) -> Result<(), AgentError> {
    let identity = config.identity()?;
    info!(client_id = %identity.client_id(), "Configuration is valid");

    if show {
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| AgentError::internal(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }
    Ok(())
}
