//! # switchyard
//!
//! Gateway binary: loads settings, starts the worker pool and feeds it from
//! the built-in stdio channel until stdin closes or a shutdown signal arrives.

#![deny(unsafe_code)]

mod reload;
mod shutdown;
mod stdio;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use switchyard_core::logging::{LogFormat, init_subscriber};
use switchyard_runtime::Gateway;
use switchyard_settings::{load_settings_from_path, settings_path};
use switchyard_worker::{ProcessOptions, ProcessSpawner};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};

/// Chat-to-agent gateway over a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about)]
struct Cli {
    /// Settings file (default: `$SWITCHYARD_CONFIG` or `~/.switchyard/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides `logging.level`).
    #[arg(long)]
    log_level: Option<String>,

    /// Log line format: `compact` or `json`.
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Do not watch the settings file for changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config_path = args.config.unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path.display()))?;

    let level = args.log_level.as_deref().unwrap_or(&settings.logging.level);
    init_subscriber(level, args.log_format);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start Prometheus exporter")?;
        info!(%addr, "serving metrics");
    }

    let spawner = Arc::new(ProcessSpawner::new(ProcessOptions::from_settings(&settings.agent.pool)));
    let gateway = Gateway::new(settings, spawner);
    let mut handles = gateway.start();

    let coordinator = ShutdownCoordinator::new();
    handles.push(coordinator.listen_for_signals());

    if !args.no_watch {
        handles.push(reload::spawn_reload_loop(
            gateway.clone(),
            config_path.clone(),
            coordinator.token(),
        )?);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = stdio::spawn_writer(tokio::io::stdout(), rx);
    info!(config = %config_path.display(), "switchyard started");

    let token = coordinator.token();
    let reader = BufReader::new(tokio::io::stdin());
    stdio::run(gateway.clone(), reader, tx, token.clone()).await;

    if !coordinator.is_triggered() {
        // stdin closed: let in-flight turns finish unless a signal arrives
        tokio::select! {
            () = token.cancelled() => {}
            () = stdio::wait_idle(&gateway, Duration::from_millis(100)) => {}
        }
    }

    coordinator.drain(&gateway, handles, DEFAULT_SHUTDOWN_TIMEOUT).await;
    drop(gateway);
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    info!("switchyard stopped");
    Ok(())
}
