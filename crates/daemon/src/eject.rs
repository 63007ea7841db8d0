//! Eject controller.

use crate::process::{run_with_sudo_fallback, ToolError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error type for eject operations
#[derive(Debug, Error)]
pub enum EjectError {
    #[error("Eject failed: {0}")]
    Tool(#[from] ToolError),
}

/// Physical tray release
#[async_trait]
pub trait Ejector: Send + Sync {
    async fn eject(&self, device: &Path, force: bool) -> Result<(), EjectError>;
}

/// Arguments for the `eject` utility
pub fn eject_args(device: &Path, force: bool) -> Vec<OsString> {
    let mut args = Vec::with_capacity(2);
    if force {
        args.push(OsString::from("-F"));
    }
    args.push(device.as_os_str().to_os_string());
    args
}

/// Ejector running the `eject` utility, through sudo if needed
#[derive(Debug, Clone)]
pub struct SystemEjector {
    use_sudo: bool,
    grace: Duration,
}

impl SystemEjector {
    pub fn new(use_sudo: bool, grace: Duration) -> Self {
        Self { use_sudo, grace }
    }
}

#[async_trait]
impl Ejector for SystemEjector {
    async fn eject(&self, device: &Path, force: bool) -> Result<(), EjectError> {
        // never cancelled: the drive must be released even during shutdown
        let token = CancellationToken::new();
        run_with_sudo_fallback(
            "eject",
            eject_args(device, force),
            self.use_sudo,
            &token,
            self.grace,
        )
        .await?;
        Ok(())
    }
}

/// Result of releasing the drive at the end of a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EjectOutcome {
    Ejected,
    /// `eject_on_completion` is off and the release was not forced
    Skipped,
    Failed(String),
}

/// Releases the drive at the end of every cycle
pub struct EjectController {
    ejector: Arc<dyn Ejector>,
    device: PathBuf,
    eject_on_completion: bool,
    invocations: AtomicU64,
}

impl EjectController {
    pub fn new(ejector: Arc<dyn Ejector>, device: PathBuf, eject_on_completion: bool) -> Self {
        Self {
            ejector,
            device,
            eject_on_completion,
            invocations: AtomicU64::new(0),
        }
    }

    /// Release the drive
    ///
    /// `force` ejects even with `eject_on_completion` off and passes `-F`;
    /// used for discs that never became readable.
    /// Failure is logged and reported, never propagated.
    pub async fn eject(&self, force: bool) -> EjectOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.eject_on_completion && !force {
            info!(device = %self.device.display(), "Leaving disc in drive (eject disabled)");
            return EjectOutcome::Skipped;
        }

        match self.ejector.eject(&self.device, force).await {
            Ok(()) => {
                info!(device = %self.device.display(), force, "Disc ejected");
                EjectOutcome::Ejected
            }
            Err(e) => {
                error!(device = %self.device.display(), error = %e, "Eject failed");
                EjectOutcome::Failed(e.to_string())
            }
        }
    }

    /// Number of times the controller was asked to release the drive
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }
}
