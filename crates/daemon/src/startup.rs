//! Startup checks for the disc ripper
//!
//! Preflight checks run before the poll loop:
//! - Output and WIP roots exist
//! - The drive device exists
//! - External tools can be started
//! - Leftover WIP directories are resumed or discarded

use crate::config::Config;
use crate::output::OutputLayout;
use crate::wip::{sweep, SweepReport, WipError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// External tools and the arguments used to probe them
const REQUIRED_TOOLS: &[(&str, &[&str])] = &[
    ("blkid", &["-V"]),
    ("cdparanoia", &["-V"]),
    ("dd", &["--version"]),
    ("abcde", &["-v"]),
    ("makemkvcon", &["--version"]),
    ("ffmpeg", &["-version"]),
    ("eject", &["--version"]),
];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{what} does not exist: {path}")]
    MissingDirectory { what: &'static str, path: PathBuf },

    #[error("{what} is not a directory: {path}")]
    NotADirectory { what: &'static str, path: PathBuf },

    #[error("Drive device does not exist: {0}")]
    MissingDevice(PathBuf),

    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("WIP sweep failed: {0}")]
    Sweep(#[from] WipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StartupError {
    /// Errors the operator fixes in configuration, as opposed to runtime IO
    pub fn is_configuration(&self) -> bool {
        !matches!(self, StartupError::Sweep(_) | StartupError::Io(_))
    }
}

/// What startup found and cleaned up
#[derive(Debug)]
pub struct StartupReport {
    pub layout: OutputLayout,
    pub sweep: SweepReport,
    /// Interrupted cross-device promotions removed from the output tree
    pub incoming_removed: Vec<PathBuf>,
}

fn require_dir(what: &'static str, path: &Path) -> Result<(), StartupError> {
    if !path.exists() {
        return Err(StartupError::MissingDirectory {
            what,
            path: path.to_path_buf(),
        });
    }
    if !path.is_dir() {
        return Err(StartupError::NotADirectory {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Check both roots and create the output subtrees
///
/// The roots themselves are never created.
pub fn validate_layout(cfg: &Config) -> Result<OutputLayout, StartupError> {
    require_dir("Output root", &cfg.paths.out_root)?;
    require_dir("WIP root", &cfg.paths.wip_root)?;
    let layout = OutputLayout::new(&cfg.paths.out_root);
    layout.ensure()?;
    Ok(layout)
}

/// Check the configured drive device exists
pub fn check_device(cfg: &Config) -> Result<(), StartupError> {
    if cfg.drive.device.exists() {
        Ok(())
    } else {
        Err(StartupError::MissingDevice(cfg.drive.device.clone()))
    }
}

/// Check a tool can be started
///
/// Only a failed spawn counts: several tools exit non-zero for their
/// version flags.
pub fn check_tool_available(tool: &str, args: &[&str]) -> Result<(), StartupError> {
    let output = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("failed to run {}; is it installed and in PATH? Error: {}", tool, e),
        })?;
    debug!(tool, status = ?output.status, "Tool responded");
    Ok(())
}

/// Check every external tool the pipelines use
pub fn check_tools() -> Result<(), StartupError> {
    for (tool, args) in REQUIRED_TOOLS {
        check_tool_available(tool, args)?;
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Roots and output subtrees
/// 2. Drive device
/// 3. External tools (unless `check_external_tools` is false)
/// 4. WIP sweep and removal of interrupted promotions
pub fn run_startup_checks(
    cfg: &Config,
    check_external_tools: bool,
) -> Result<StartupReport, StartupError> {
    let layout = validate_layout(cfg)?;
    check_device(cfg)?;
    if check_external_tools {
        check_tools()?;
    } else {
        warn!("Skipping external tool checks");
    }

    let sweep = sweep(&cfg.paths.wip_root, cfg.output.resume_interrupted)?;
    let incoming_removed = layout.sweep_incoming();
    info!(
        resumable = sweep.resumable.len(),
        discarded = sweep.discarded.len(),
        flagged = sweep.flagged.len(),
        incoming_removed = incoming_removed.len(),
        "Startup checks passed"
    );

    Ok(StartupReport {
        layout,
        sweep,
        incoming_removed,
    })
}
