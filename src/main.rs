//! # Road Recorder
//!
//! Vehicle telemetry daemon: samples the IMU at a fixed rate, detects
//! driving events and keeps everything in a crash-tolerant local store.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load and validate configuration (first argument, or
//!      `config/default.toml`)
//!    - Set up logging to stderr and an optional daily log file
//!    - Open the IMU and the bus recovery lines
//!    - Start the recorder and tell systemd we are ready
//!
//! 2. **Main Loop**
//!    - Wait for Ctrl+C, SIGTERM or a reboot request from the supervisor
//!
//! 3. **Shutdown**
//!    - Stop acquisition, drain the storage queue, close the store
//!    - On a reboot request, reboot (when allowed) or exit with failure so
//!      the service manager restarts us
//!
//! # Examples
//!
//! ```bash
//! roadrecorder /etc/roadrecorder/config.toml
//! RUST_LOG=roadrecorder=debug roadrecorder
//! ```

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use roadrecorder::config::{Config, LoggingConfig};
use roadrecorder::daemon::{Daemon, DaemonExit};
use roadrecorder::sensor::gpio::SysfsBusLines;
use roadrecorder::sensor::mpu6050::Mpu6050;
use roadrecorder::watchdog::keepalive;
use roadrecorder::watchdog::SystemdNotify;

/// Used when no configuration path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Exit status after a reboot request that we may not act on
const EXIT_REBOOT_REQUESTED: i32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    // Flushes the log file on drop; keep it until main returns
    let _log_guard = init_logging(&config.logging)?;

    info!("Road Recorder v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "Configuration loaded");

    let bus = Mpu6050::open(&config.sampler).context("Failed to open IMU")?;
    info!("IMU opened at: {}", bus.device_path());
    let lines = SysfsBusLines::new(&config.bus_recovery);
    let keepalive = keepalive::from_config(&config.watchdog)?;

    let mut daemon = Daemon::start(&config, bus, lines, keepalive).await?;

    let mut notify = SystemdNotify::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "systemd notify socket unavailable");
        None
    });
    if let Some(notify) = notify.as_mut() {
        if let Err(e) = notify.ready() {
            warn!(error = %e, "Failed to notify systemd of readiness");
        }
    }
    info!("Press Ctrl+C to exit");

    let exit = daemon.wait(shutdown_signal()).await;

    if let Some(notify) = notify.as_mut() {
        let _ = notify.stopping();
    }
    if let Some(stats) = daemon.shutdown().await {
        info!(committed = stats.committed, failed = stats.failed, "Recorder stopped");
    }

    match exit {
        DaemonExit::Shutdown => Ok(()),
        DaemonExit::RebootRequested(request) => {
            if config.watchdog.allow_reboot {
                error!(cause = %request.cause, "Rebooting");
                let status = tokio::process::Command::new("systemctl")
                    .arg("reboot")
                    .status()
                    .await
                    .context("Failed to run systemctl reboot")?;
                if status.success() {
                    return Ok(());
                }
                error!(%status, "systemctl reboot failed");
            } else {
                error!(cause = %request.cause, "Reboot requested but not allowed, exiting");
            }
            std::process::exit(EXIT_REBOOT_REQUESTED);
        }
    }
}

/// stderr always; a daily-rolling file too when `log_dir` is set.
///
/// `RUST_LOG` is honoured, with the configured level added on top.
fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let directive: Directive = config
        .level
        .parse()
        .with_context(|| format!("Invalid log level '{}'", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if config.log_dir.is_empty() {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;
    let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(Some(guard))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
}
