//! Diagcap Binary Entry Point
//!
//! Captures process and host diagnostics into a rotating directory until
//! interrupted. Core functionality is provided by the `diagcap` library crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use diagcap::{
    CaptureConfig, Controller, FileSinkFactory, Setting,
    collector::system::{BuildInfoCollector, HostCollector, ProcessCollector},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Diagcap - Background Diagnostic Capture
#[derive(Parser, Debug)]
#[command(name = "diagcap", version, about, long_about = None)]
struct Cli {
    /// Path to a YAML capture configuration file
    #[arg(short, long, env = "DIAGCAP_CONFIG")]
    config: Option<PathBuf>,

    /// Output directory (overrides config file)
    #[arg(short, long, env = "DIAGCAP_DIRECTORY")]
    directory: Option<PathBuf>,

    /// Sampling period, e.g. `1s` or `250ms` (overrides config file)
    #[arg(short, long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Whether sampling is enabled (overrides config file)
    #[arg(long)]
    enabled: Option<bool>,

    /// Extra runtime settings as `name=value`, e.g. `maxFileSizeBytes=4MiB`
    #[arg(long = "set", value_name = "NAME=VALUE")]
    settings: Vec<Setting>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,diagcap=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Diagcap - Background Diagnostic Capture");

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            CaptureConfig::load(path)?
        }
        None => CaptureConfig::default(),
    };

    // Apply CLI/env overrides (CLI > ENV > config file)
    if let Some(directory) = cli.directory {
        config.directory = Some(directory);
    }
    if let Some(period) = cli.period {
        config.period = Some(period);
    }
    // Capturing is the point of the binary: enable once a directory is known.
    config.enabled = cli.enabled.or(config.enabled).or(Some(config.directory.is_some()));
    config.validate()?;

    let controller = Arc::new(Controller::new(FileSinkFactory));
    controller.add_periodic_collector(ProcessCollector::new());
    controller.add_periodic_collector(HostCollector);
    controller.add_on_rotate_collector(BuildInfoCollector);

    config.apply_to(&controller)?;
    for setting in cli.settings {
        controller.apply(setting)?;
    }

    let active = controller.configuration();
    tracing::info!(
        "Capture: enabled={}, period={}, directory={}",
        active.enabled(),
        humantime::format_duration(active.period()),
        active
            .directory()
            .map_or_else(|| "<unset>".to_string(), |d| d.display().to_string()),
    );

    controller.start()?;
    tracing::info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;

    tracing::info!("Stopping capture...");
    let stopped = Arc::clone(&controller);
    tokio::task::spawn_blocking(move || stopped.stop()).await?;

    let last = controller.most_recent_document();
    if !last.is_empty() {
        tracing::info!("Last sample: {}", serde_json::to_string(&last)?);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
