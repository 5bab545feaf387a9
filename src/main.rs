//! # Rover Link
//!
//! Supervise a MAVLink link to an ArduPilot rover and expose telemetry
//! snapshots plus a safety-gated RC-override channel to embedding layers.

use anyhow::Result;
use std::path::Path;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rover_link::config::Config;
use rover_link::connection::ConnectionManager;
use rover_link::controller::RoverController;
use rover_link::telemetry::TelemetryAggregator;
use rover_link::transport::mavlink_port::MavlinkConnector;

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Seconds between periodic status log lines
const STATUS_LOG_INTERVAL_S: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path);

    let _log_guard = init_logging(&config);
    info!("Rover Link v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Vehicle endpoint: {}", config.link.endpoint);

    // Wire the link manager: connection, telemetry, controller
    let connector = MavlinkConnector::new();
    let manager = ConnectionManager::new(&config, connector);
    let telemetry = TelemetryAggregator::new(config.telemetry.clone());
    telemetry.attach(&manager);
    let controller = RoverController::new(manager.clone(), telemetry.clone(), &config);

    // A failed first attempt schedules reconnects internally; keep running
    if !manager.connect().await {
        warn!(
            "Initial connection failed, retrying every {}s",
            config.link.reconnect_backoff_s
        );
    }

    info!("Press Ctrl+C to exit");
    let mut status_interval = interval(Duration::from_secs(STATUS_LOG_INTERVAL_S));
    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                log_status(&manager, &telemetry);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    // Clear any live override before dropping the link
    controller.shutdown().await;
    manager.disconnect().await;
    info!("Shutdown complete");

    Ok(())
}

/// Load the configuration file, falling back to defaults when it is absent
fn load_config(path: &str) -> Config {
    if Path::new(path).exists() {
        match Config::load(path) {
            Ok(config) => {
                eprintln!("Loaded configuration from {}", path);
                return config;
            }
            Err(e) => {
                eprintln!("Failed to load {}: {} - using defaults", path, e);
            }
        }
    } else {
        eprintln!("No configuration at {} - using defaults", path);
    }
    Config::default()
}

/// Console logging plus an optional daily-rolling file
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if config.log.to_file {
        if let Err(e) = std::fs::create_dir_all(&config.log.dir) {
            eprintln!("Cannot create log directory {}: {}", config.log.dir, e);
        }
        let appender = tracing_appender::rolling::daily(&config.log.dir, "rover-link.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    }
}

/// One-line health summary, mirroring what a dashboard would poll
fn log_status(manager: &ConnectionManager, telemetry: &TelemetryAggregator) {
    if !manager.is_connected() {
        info!("Link {:?}, waiting for vehicle", manager.phase());
        return;
    }
    let dashboard = telemetry.dashboard_data();
    info!(
        "mode={} armed={} speed={:.1}m/s heading={:.0} sats={} battery={}",
        dashboard.system.flight_mode,
        dashboard.system.armed,
        dashboard.velocity.ground_speed,
        dashboard.velocity.heading,
        dashboard.system.satellites_visible,
        dashboard
            .battery
            .voltage
            .map(|v| format!("{:.1}V", v))
            .unwrap_or_else(|| "unknown".to_string()),
    );
    if let Ok(json) = serde_json::to_string(&dashboard) {
        debug!("dashboard {}", json);
    }
}
