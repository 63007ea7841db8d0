//! Daemon startup and main loop for the disc ripper
//!
//! Provides the daemon entry point, startup sequence, and main polling loop.

use crate::config::{Config, ConfigError};
use crate::dispatcher::{Components, Dispatcher};
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::startup::{run_startup_checks, StartupError};
use crate::wip::WipDir;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for a clean shutdown
pub const EXIT_OK: i32 = 0;
/// Exit code for runtime failures
pub const EXIT_RUNTIME: i32 = 1;
/// Exit code for configuration and startup errors
pub const EXIT_CONFIG: i32 = 2;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Failed to install signal handlers
    #[error("Signal handling error: {0}")]
    Signal(std::io::Error),
}

impl DaemonError {
    /// Process exit code for supervisors: 2 for configuration, 1 for runtime
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Config(_) => EXIT_CONFIG,
            DaemonError::Startup(e) if e.is_configuration() => EXIT_CONFIG,
            DaemonError::Startup(_) | DaemonError::Signal(_) => EXIT_RUNTIME,
        }
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file, environment and CLI
    pub config: Config,
    /// Shared status snapshot
    pub metrics: SharedMetrics,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
}

impl Daemon {
    /// Initialize the daemon against the real drive and tools
    ///
    /// This performs the full startup sequence:
    /// 1. Validate configuration
    /// 2. Run startup checks (roots, device, tools, WIP sweep)
    /// 3. Build the dispatcher and queue resumable Jobs
    pub fn new(config: Config, check_tools: bool) -> Result<Self, DaemonError> {
        config.validate()?;
        let report = run_startup_checks(&config, check_tools)?;
        for path in &report.sweep.flagged {
            warn!(path = %path.display(), "WIP directory still needs cleanup");
        }
        let components = Components::system(&config);
        Self::with_components(config, components, report.sweep.resumable)
    }

    /// Initialize the daemon with explicit components, skipping startup checks
    ///
    /// Useful for testing with in-memory drives and toolchains.
    pub fn with_components(
        config: Config,
        components: Components,
        resumable: Vec<WipDir>,
    ) -> Result<Self, DaemonError> {
        let metrics = new_shared_metrics();
        let cancel = CancellationToken::new();
        let mut dispatcher = Dispatcher::new(&config, components, metrics.clone(), cancel.clone())?;
        dispatcher.resume(resumable);

        Ok(Self {
            config,
            metrics,
            cancel,
            dispatcher,
        })
    }

    /// Token that stops the daemon when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Cancel the daemon on SIGINT or SIGTERM
    pub fn spawn_signal_listener(&self) -> Result<JoinHandle<()>, DaemonError> {
        let cancel = self.cancel.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
            Ok(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                    _ = cancel.cancelled() => return,
                }
                cancel.cancel();
            }))
        }

        #[cfg(not(unix))]
        {
            Ok(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = cancel.cancelled() => return,
                }
                cancel.cancel();
            }))
        }
    }

    /// Run the daemon main loop until cancelled
    ///
    /// After cancellation the active cycle is driven to its end, so in-flight
    /// tools are stopped, WIP is cleaned and the drive is released before
    /// returning.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        info!(device = %self.config.drive.device.display(), "Waiting for discs");
        loop {
            if self.cancel.is_cancelled() && self.dispatcher.is_idle() {
                break;
            }

            let delay = self.dispatcher.tick().await;
            if self.dispatcher.is_idle() && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        let snapshot = self.metrics.read().await.clone();
        info!(
            succeeded = snapshot.jobs_succeeded,
            failed = snapshot.jobs_failed,
            skipped = snapshot.discs_skipped,
            "Shutting down"
        );
        Ok(())
    }
}
