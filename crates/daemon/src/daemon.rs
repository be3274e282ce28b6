//! Daemon startup and main loop
//!
//! Wires configuration, startup checks, hardware discovery and the HTTP
//! server together, and owns the root cancellation token every stream
//! session hangs off.

use crate::config::{Config, ConfigError, TranscodeMode};
use crate::hardware::{Detector, HardwareCatalog};
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::server::{create_router, run_server, AppState, ServerError};
use crate::session::{StreamSettings, StreamTranscoder};
use crate::startup::{run_startup_checks, StartupError};
use axum::Router;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Probe the host for encoders using the configured ffmpeg.
pub async fn discover_hardware(config: &Config) -> HardwareCatalog {
    Detector::new(config.encoder.ffmpeg_path.clone()).discover().await
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Validated configuration
    pub config: Config,
    /// Devices found at startup
    pub catalog: HardwareCatalog,
    /// Shared session counters
    pub metrics: SharedMetrics,
    transcoder: StreamTranscoder,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Full startup sequence:
    /// 1. Validate the configuration
    /// 2. Run startup checks (ffmpeg, ffprobe)
    /// 3. Discover hardware (CPU only in copy mode)
    /// 4. Log the device listing
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config).await?;

        let catalog = if config.transcode.mode == TranscodeMode::Copy {
            HardwareCatalog::cpu_only()
        } else {
            discover_hardware(&config).await
        };

        Self::new_without_checks(config, catalog)
    }

    /// Build the daemon around an existing catalog without touching external
    /// tools.
    pub fn new_without_checks(
        config: Config,
        catalog: HardwareCatalog,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        catalog.log_devices();

        let settings = StreamSettings::from_config(&config)?;
        let metrics = new_shared_metrics();
        let shutdown = CancellationToken::new();
        let transcoder = StreamTranscoder::new(
            settings,
            catalog.clone(),
            metrics.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            config,
            catalog,
            metrics,
            transcoder,
            shutdown,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Token that stops the server and every running stream
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn router(&self) -> Router {
        create_router(AppState {
            transcoder: self.transcoder.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Listen address from `server.bind_addr` and `server.port`
    pub fn listen_addr(&self) -> Result<SocketAddr, DaemonError> {
        let ip: IpAddr = self.config.server.bind_addr.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid bind address '{}'",
                self.config.server.bind_addr
            ))
        })?;
        Ok(SocketAddr::new(ip, self.config.server.port))
    }

    /// Serve until Ctrl-C or SIGTERM, then cancel all sessions.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let addr = self.listen_addr()?;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down");
            shutdown.cancel();
        });

        run_server(self.router(), addr, self.shutdown.clone()).await?;
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
