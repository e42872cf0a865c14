//! doorwatch - garage door monitoring and control service
//!
//! Polls door position sensors on a fixed interval, infers logical door
//! states, pulses relays on command, pushes settled states to home-automation
//! collaborators, and fans alerts out over the configured channels.
//!
//! Module structure:
//! - `domain/` - Core door types (DoorState, DoorAction, DoorUpdate)
//! - `io/` - External interfaces (GPIO port, HTTP surface, state sync)
//! - `services/` - Business logic (Controller, Door, AlertDispatcher, UpdateBroker)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use doorwatch::infra::{Config, Metrics};
use doorwatch::io::{start_http_server, DoorPort, HttpState, MemoryPort, StateSync};
use doorwatch::services::{AlertDispatcher, Controller, Registry, UpdateBroker};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// doorwatch - garage door monitoring and control service
#[derive(Parser, Debug)]
#[command(name = "doorwatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "doorwatch starting");

    let args = Args::parse();

    // A broken configuration is fatal: never start monitoring doors with a
    // partial door table or half-configured alert channels.
    let config = Config::from_file(&args.config)?;
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        doors = %config.doors().len(),
        http_port = %config.http_port(),
        poll_interval_ms = %config.poll_interval_ms(),
        alerts_enabled = %config.alerts_enabled(),
        channels = ?config.channels().iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        openhab = %config.openhab_enabled(),
        ifttt_sync = %config.ifttt_sync_enabled(),
        api_enabled = %config.api_enabled(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(RwLock::new(Registry::from_config(
        &config,
        doorwatch::domain::epoch_ms(),
    )));
    let broker = Arc::new(UpdateBroker::new(metrics.clone()));
    let dispatcher = AlertDispatcher::from_config(&config, metrics.clone())?;
    let sync = Arc::new(StateSync::from_config(&config)?);
    let port: Arc<dyn DoorPort> = Arc::new(MemoryPort::new());

    // Command channel (bounded; the HTTP surface enqueues, the controller drains)
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    // Start HTTP server
    let http_state = Arc::new(HttpState::new(
        registry.clone(),
        broker.clone(),
        cmd_tx,
        metrics.clone(),
        config.clone(),
    ));
    let http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_http_server(http_state, http_shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run controller - polls doors and applies commands until shutdown
    let controller =
        Controller::new(config, registry, broker, dispatcher, sync, port, metrics, cmd_rx);
    controller.run(shutdown_rx).await;

    info!("doorwatch shutdown complete");
    Ok(())
}
