#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use vigild::control::{ControlConfig, ControlState, ReloadLevelControl};
use vigild::{ConfigLoader, ControlServer, FeedConfig, FeedServer, HookSet, SensorService};

/// Parse and validate the decision timeout argument (milliseconds).
fn parse_timeout_ms(s: &str) -> Result<u64, String> {
    let timeout: u64 = s
        .parse()
        .map_err(|_parse_err| format!("Invalid timeout '{s}': must be a number"))?;

    if timeout < 100 {
        Err(format!(
            "Timeout too small: {timeout} ms. Minimum allowed is 100 ms"
        ))
    } else if timeout > 60_000 {
        Err(format!(
            "Timeout too large: {timeout} ms. Maximum allowed is 60000 ms (1 minute)"
        ))
    } else {
        Ok(timeout)
    }
}

#[derive(Parser)]
#[command(name = "vigild")]
#[command(about = "Vigil Endpoint Sensor Daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Control socket path
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Event feed socket path
    #[arg(long)]
    feed_socket: Option<PathBuf>,

    /// Decision timeout in milliseconds (minimum: 100, maximum: 60000)
    #[arg(long, value_parser = parse_timeout_ms)]
    decision_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging with a reloadable level filter so the control
    // surface can adjust verbosity at runtime.
    let initial_level: LevelFilter = cli
        .log_level
        .parse()
        .map_err(|_| format!("invalid log level '{}'", cli.log_level))?;
    let (filter_layer, reload_handle) = reload::Layer::new(initial_level);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration and apply CLI overrides.
    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;
    if let Some(path) = cli.control_socket {
        config.control.socket_path = path;
    }
    if let Some(path) = cli.feed_socket {
        config.control.feed_socket_path = path;
    }
    if let Some(timeout_ms) = cli.decision_timeout_ms {
        config.sensor.decision_timeout = Duration::from_millis(timeout_ms);
    }

    // Interception hook points are contributed by platform integrations;
    // the stock daemon brings up the decision core with its control and
    // feed surfaces.
    let hooks = HookSet::new(Vec::new());
    let mut service = SensorService::start(&config.sensor, hooks)?;

    let state = Arc::new(ControlState::new(
        service.ledger(),
        service.classifier(),
        service.channels(),
        Arc::new(ReloadLevelControl::new(reload_handle)),
    ));
    let mut control = ControlServer::new(
        ControlConfig {
            socket_path: config.control.socket_path.clone(),
            max_frame_bytes: config.control.max_frame_bytes,
            write_timeout: Duration::from_millis(config.control.write_timeout_ms),
        },
        state,
    );
    control.start().await?;

    let channels = service.channels();
    let mut feed = FeedServer::new(
        FeedConfig {
            socket_path: config.control.feed_socket_path.clone(),
            max_frame_bytes: config.control.max_frame_bytes,
            write_timeout: Duration::from_millis(config.control.write_timeout_ms),
        },
        &channels,
    );
    feed.start().await?;

    info!("vigild running, waiting for shutdown signal");
    wait_for_shutdown().await;
    info!("shutdown signal received");

    // Teardown order: stop accepting external input, then quiesce the
    // pipeline (stop blocks until no operation is in flight).
    control.stop();
    feed.stop();
    tokio::task::block_in_place(|| service.stop());

    info!("vigild exited cleanly");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!(error = %e, "failed to listen for Ctrl+C");
                        }
                    }
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for Ctrl+C");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
