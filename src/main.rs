//! Sockmux - Local SOCKS5 proxy with multiplexed relay
//!
//! This is the main entry point for the Sockmux application.

use anyhow::{Context, Result};
use clap::Parser;
use sockmux::client::run_client;
use sockmux::config::{load_config, Config, ResolverType};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Sockmux - Local SOCKS5 proxy relaying directly or through a remote peer
#[derive(Parser, Debug)]
#[command(name = "sockmux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file, defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SOCKS5 listening port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Remote relay address; switches to the delegated resolver
    #[arg(short, long)]
    remote: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    info!("Sockmux v{}", sockmux::VERSION);

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to setup SIGTERM handler")?;
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx_clone.send(true);
    });

    // Run the client
    run_client(config, shutdown_rx).await
}

/// Apply command line overrides on top of the loaded configuration
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(port) = args.port {
        config.listener.port = port;
    }
    if let Some(remote) = &args.remote {
        config.remote.addr = remote.clone();
        config.resolver.resolver_type = ResolverType::Delegated;
    }
}

/// Setup logging based on configuration
///
/// `RUST_LOG` takes precedence over the level flag when set.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
