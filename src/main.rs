//! Switchyard - Rule-Routed Local Proxy Daemon
//!
//! This is the main entry point for the Switchyard application.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::config::load_config;
use switchyard::daemon::Daemon;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Switchyard - local HTTP/SOCKS5 proxy with rule-based upstream routing
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

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

    setup_logging(&args.log_level, args.json_log)?;

    let config = load_config(&args.config)?;

    info!("Switchyard v{}", switchyard::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    if let Some(addr) = config.server.http_addr() {
        info!("HTTP inbound: {}", addr);
    }
    if let Some(addr) = config.server.socks_addr() {
        info!("SOCKS5 inbound: {}", addr);
    }

    let daemon = Arc::new(Daemon::new(config)?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())
                .expect("Failed to setup SIGTERM handler");

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
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx_clone.send(true);
    });

    #[cfg(unix)]
    spawn_reload_handler(daemon.clone(), args.config.clone(), shutdown_tx.subscribe());

    daemon.run(shutdown_rx).await
}

/// Reload the configuration file on SIGHUP until shutdown
#[cfg(unix)]
fn spawn_reload_handler(
    daemon: Arc<Daemon>,
    path: PathBuf,
    mut shutdown_rx: broadcast::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    let mut sighup = signal(SignalKind::hangup()).expect("Failed to setup SIGHUP handler");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading {:?}", path);
                    let result = load_config(&path).and_then(|config| daemon.reload(config));
                    if let Err(e) = result {
                        error!("Reload failed, keeping current configuration: {:#}", e);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
