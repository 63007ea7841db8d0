//! Drive monitor for the optical device.
//!
//! Polls the drive for tray and media state and tracks consecutive
//! unreadable polls so a flaky disc cannot stall the loop forever.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Observed state of the drive at one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    /// Tray closed, no medium
    Empty,
    /// Tray is open
    TrayOpen,
    /// A medium is present but not ready for I/O (spinning up, read error)
    DiscPresentUnreadable,
    /// A medium is present and readable
    DiscPresentReady,
}

impl std::fmt::Display for DriveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveState::Empty => write!(f, "empty"),
            DriveState::TrayOpen => write!(f, "tray_open"),
            DriveState::DiscPresentUnreadable => write!(f, "disc_unreadable"),
            DriveState::DiscPresentReady => write!(f, "disc_ready"),
        }
    }
}

/// Error type for drive queries
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Drive status query failed: {0}")]
    Query(std::io::Error),

    #[error("Drive status queries are not supported on this platform")]
    Unsupported,
}

/// Read-only access to the drive hardware
#[async_trait]
pub trait DriveProbe: Send + Sync {
    /// Current tray/media state
    async fn status(&self, device: &Path) -> Result<DriveState, DriveError>;

    /// Size of the medium in bytes
    async fn capacity(&self, device: &Path) -> Result<u64, DriveError>;
}

// linux/cdrom.h
const CDROM_DRIVE_STATUS: u64 = 0x5326;
const CDSL_CURRENT: i32 = i32::MAX;
const CDS_NO_DISC: i32 = 1;
const CDS_TRAY_OPEN: i32 = 2;
const CDS_DRIVE_NOT_READY: i32 = 3;
const CDS_DISC_OK: i32 = 4;

/// Map a `CDROM_DRIVE_STATUS` result to a drive state
pub fn map_cdrom_status(code: i32) -> DriveState {
    match code {
        CDS_NO_DISC => DriveState::Empty,
        CDS_TRAY_OPEN => DriveState::TrayOpen,
        CDS_DISC_OK => DriveState::DiscPresentReady,
        // CDS_NO_INFO and CDS_DRIVE_NOT_READY: try again later
        CDS_DRIVE_NOT_READY => DriveState::DiscPresentUnreadable,
        _ => DriveState::DiscPresentUnreadable,
    }
}

/// Drive probe using the Linux cdrom ioctl interface
#[derive(Debug, Clone, Default)]
pub struct CdromIoctlProbe;

#[async_trait]
impl DriveProbe for CdromIoctlProbe {
    async fn status(&self, device: &Path) -> Result<DriveState, DriveError> {
        let device = device.to_path_buf();
        tokio::task::spawn_blocking(move || query_drive_status(&device))
            .await
            .map_err(|e| DriveError::Query(std::io::Error::other(e)))?
            .map(map_cdrom_status)
    }

    async fn capacity(&self, device: &Path) -> Result<u64, DriveError> {
        let device = device.to_path_buf();
        tokio::task::spawn_blocking(move || {
            use std::io::{Seek, SeekFrom};
            let mut file = std::fs::File::open(&device).map_err(|source| DriveError::Open {
                path: device.clone(),
                source,
            })?;
            file.seek(SeekFrom::End(0)).map_err(DriveError::Query)
        })
        .await
        .map_err(|e| DriveError::Query(std::io::Error::other(e)))?
    }
}

#[cfg(target_os = "linux")]
fn query_drive_status(device: &Path) -> Result<i32, DriveError> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    // O_NONBLOCK lets the open succeed with no medium or an open tray
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
        .map_err(|source| DriveError::Open {
            path: device.to_path_buf(),
            source,
        })?;

    // SAFETY: the descriptor stays open for the duration of the call and
    // CDROM_DRIVE_STATUS takes its slot argument by value.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), CDROM_DRIVE_STATUS as _, CDSL_CURRENT) };
    if rc < 0 {
        return Err(DriveError::Query(std::io::Error::last_os_error()));
    }
    Ok(rc)
}

#[cfg(not(target_os = "linux"))]
fn query_drive_status(_device: &Path) -> Result<i32, DriveError> {
    Err(DriveError::Unsupported)
}

/// Result of feeding one observed state to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No medium; nothing to do
    NoDisc(DriveState),
    /// Medium present but unreadable; `attempt` consecutive failures so far
    NotReady { attempt: u32 },
    /// Medium ready for classification
    Ready,
    /// Too many consecutive unreadable polls; abandon the cycle
    GaveUp { attempts: u32 },
}

/// Poll delay with exponential backoff on consecutive failures
///
/// Zero failures yields `base`; each failure doubles it, capped at `max`
/// (or at `base` when `max` is smaller).
pub fn backoff_delay(base: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return base;
    }
    let factor = 1u32 << failures.min(16);
    let delay = base.saturating_mul(factor);
    delay.min(max.max(base))
}

/// Polls a single device and counts consecutive unreadable results
pub struct DriveMonitor {
    device: PathBuf,
    probe: Arc<dyn DriveProbe>,
    poll_interval: Duration,
    backoff_max: Duration,
    max_failures: u32,
    failures: u32,
}

impl DriveMonitor {
    pub fn new(
        device: PathBuf,
        probe: Arc<dyn DriveProbe>,
        poll_interval: Duration,
        backoff_max: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            device,
            probe,
            poll_interval,
            backoff_max,
            max_failures: max_failures.max(1),
            failures: 0,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn probe(&self) -> &Arc<dyn DriveProbe> {
        &self.probe
    }

    /// Query the drive; any query error reads as an unreadable disc
    pub async fn poll_drive(&self) -> DriveState {
        match self.probe.status(&self.device).await {
            Ok(state) => state,
            Err(e) => {
                debug!(device = %self.device.display(), error = %e, "Drive query failed");
                DriveState::DiscPresentUnreadable
            }
        }
    }

    /// Update the failure counter with an observed state
    pub fn observe(&mut self, state: DriveState) -> PollOutcome {
        match state {
            DriveState::Empty | DriveState::TrayOpen => {
                self.failures = 0;
                PollOutcome::NoDisc(state)
            }
            DriveState::DiscPresentReady => {
                self.failures = 0;
                PollOutcome::Ready
            }
            DriveState::DiscPresentUnreadable => {
                self.failures += 1;
                if self.failures >= self.max_failures {
                    let attempts = self.failures;
                    self.failures = 0;
                    PollOutcome::GaveUp { attempts }
                } else {
                    PollOutcome::NotReady {
                        attempt: self.failures,
                    }
                }
            }
        }
    }

    /// Poll and observe in one step
    pub async fn poll(&mut self) -> PollOutcome {
        let state = self.poll_drive().await;
        self.observe(state)
    }

    /// How long to sleep before the next poll
    pub fn next_delay(&self) -> Duration {
        backoff_delay(self.poll_interval, self.failures, self.backoff_max)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
