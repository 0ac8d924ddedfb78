//! CLI Entry Point for edge-gateway
//!
//! Provides command-line interface for:
//! - Running the gateway (polling, enrichment, export, compaction)
//! - Validating a configuration file without touching any hardware
//!
//! # Usage
//!
//! Run the gateway:
//! ```bash
//! edge-gateway run --config config/gateway.toml
//! ```
//!
//! Check a configuration:
//! ```bash
//! edge-gateway check-config --config config/gateway.toml
//! ```
//!
//! Every setting can be overridden from the environment, e.g.
//! `EDGE_GATEWAY_EXPORT__URL=http://cloud:8080/api/sensor-data/upload`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edge_gateway::config::GatewayConfig;
use edge_gateway::logging::{self, OutputFormat};
use edge_gateway::Gateway;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Serial sensor edge gateway with tiered retention and cloud export", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until interrupted
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/gateway.toml")]
        config: PathBuf,

        /// Override the configured log format (pretty, compact, json)
        #[arg(long)]
        log_format: Option<String>,

        /// Log span open/close events (ticks, sweeps, compaction passes)
        #[arg(long)]
        trace_spans: bool,
    },

    /// Load and validate a configuration file, then exit
    CheckConfig {
        #[arg(long, default_value = "config/gateway.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_format,
            trace_spans,
        } => run(config, log_format, trace_spans).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &Path) -> Result<GatewayConfig> {
    GatewayConfig::load_from(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(path: PathBuf, log_format: Option<String>, trace_spans: bool) -> Result<()> {
    let config = load(&path)?;

    let mut logging_config = logging::LoggingConfig::from_gateway_config(&config)?.with_span_events(trace_spans);
    if let Some(format) = log_format {
        let format: OutputFormat = serde_json::from_value(serde_json::Value::String(format.to_lowercase()))
            .with_context(|| format!("unknown log format '{format}'"))?;
        logging_config = logging_config.with_format(format);
    }
    logging::init(logging_config)?;

    tracing::info!(config = %path.display(), "Starting edge gateway");
    let gateway = Gateway::builder(config).start().await?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    gateway.shutdown().await;
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    config.validate()?;

    println!("Configuration OK: {}", path.display());
    println!("  device:      {}", config.application.device_id);
    println!("  connections: {}", config.serial.connections.len());
    for connection in &config.serial.connections {
        println!(
            "    {} on {} ({} sensors)",
            connection.name,
            connection.port,
            config.sensors_on(&connection.name).count()
        );
    }
    println!("  sensors:     {}", config.serial.sensors.len());
    println!("  storage:     {:?}", config.storage.backend);
    Ok(())
}
