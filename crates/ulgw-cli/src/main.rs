//! Command-line interface for the Ultralight 2.0 gateway.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ulgw_bindings::{Gateway, GatewayContext};
use ulgw_codec::parse_measures;
use ulgw_core::{GatewayConfig, MemoryCommandStore, MemoryRegistry, MemorySink};

/// Ultralight 2.0 IoT gateway.
#[derive(Parser, Debug)]
#[command(name = "ulgw")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until interrupted.
    Run {
        /// Configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Load and validate a configuration file, then print it.
    CheckConfig {
        /// Configuration file.
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Decode an Ultralight measure payload and print its segments.
    Parse {
        /// Payload, e.g. `t|21#dev1@ping|ok`.
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run { config } => run_gateway(config).await,
        Command::CheckConfig { config } => check_config(config),
        Command::Parse { payload } => parse_payload(&payload),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var("ULGW_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "ulgw=debug" } else { "ulgw=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn load_config(path: &PathBuf) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::load(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_gateway(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;

    let registry = Arc::new(MemoryRegistry::from_config(&config));
    let sink = Arc::new(MemorySink::new());
    let commands = Arc::new(MemoryCommandStore::new());
    let gateway = Gateway::new(GatewayContext::new(config, registry, sink, commands));

    gateway
        .start()
        .await
        .context("Failed to start transport bindings")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    gateway.stop().await;
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn parse_payload(payload: &str) -> Result<()> {
    let segments = parse_measures(Some(payload)).context("Invalid Ultralight payload")?;
    println!("{}", serde_json::to_string_pretty(&segments)?);
    Ok(())
}
