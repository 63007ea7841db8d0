//! Job and Task model.
//!
//! A [`Job`] is one ripping attempt for one inserted disc. It owns its WIP
//! directory and, for DVDs, one [`Task`] per extracted title.

use crate::classify::DiscType;
use crate::output::PromoteError;
use crate::process::ToolError;
use crate::wip::{WipDir, WipError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Error type for a Job; the Job is the unit of failure isolation
#[derive(Debug, Error)]
pub enum JobError {
    #[error("External tool failed: {0}")]
    Tool(#[from] ToolError),

    #[error("WIP error: {0}")]
    Wip(WipError),

    #[error("Promotion failed: {0}")]
    Promote(PromoteError),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("{} of {total} titles failed: {}", failures.len(), describe_failures(failures))]
    TasksFailed {
        total: usize,
        failures: Vec<TaskFailure>,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(io::Error),
}

/// One failed Task, kept for the Job's error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub title: usize,
    pub error: String,
}

fn describe_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("title {}: {}", f.title, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

fn is_enospc(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOSPC)
}

impl From<io::Error> for JobError {
    fn from(e: io::Error) -> Self {
        if is_enospc(&e) {
            JobError::ResourceExhausted(e.to_string())
        } else {
            JobError::Io(e)
        }
    }
}

impl From<WipError> for JobError {
    fn from(e: WipError) -> Self {
        match &e {
            WipError::Io(io) | WipError::Create { source: io, .. } if is_enospc(io) => {
                JobError::ResourceExhausted(e.to_string())
            }
            _ => JobError::Wip(e),
        }
    }
}

impl From<PromoteError> for JobError {
    fn from(e: PromoteError) -> Self {
        match e.io_error() {
            Some(io) if is_enospc(io) => JobError::ResourceExhausted(e.to_string()),
            _ => JobError::Promote(e),
        }
    }
}

impl JobError {
    /// Cancellation is a shutdown, not a disc failure
    pub fn is_cancelled(&self) -> bool {
        match self {
            JobError::Cancelled => true,
            JobError::Tool(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// Terminal and running states of a Job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State of one title's transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One DVD title: an extracted source file and its transcode target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    /// 1-based title index in extraction order
    pub title: usize,
    pub source: PathBuf,
    pub target: PathBuf,
    pub status: TaskStatus,
    pub error: Option<String>,
}

impl Task {
    pub fn new(title: usize, source: PathBuf, target: PathBuf) -> Self {
        Self {
            title,
            source,
            target,
            status: TaskStatus::Pending,
            error: None,
        }
    }
}

/// One ripping attempt for one disc
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub disc_type: DiscType,
    /// Disc identifier (volume label, label-uuid, or TOC hash)
    pub disc_name: String,
    pub started_at: DateTime<Utc>,
    pub wip: WipDir,
    /// Type-specific output subtree
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub tasks: Vec<Task>,
    /// Jobs recovered from a previous run do not hold a disc
    pub owns_drive: bool,
}

impl Job {
    /// Start a Job in a fresh WIP directory
    pub fn start(
        wip_root: &Path,
        disc_type: DiscType,
        disc_name: &str,
        output_dir: &Path,
    ) -> Result<Self, JobError> {
        let wip = WipDir::create(wip_root, disc_type, disc_name)?;
        Ok(Self::from_wip(wip, output_dir, true))
    }

    /// Wrap an existing WIP directory (new or recovered)
    pub fn from_wip(wip: WipDir, output_dir: &Path, owns_drive: bool) -> Self {
        let manifest = wip.manifest().clone();
        Self {
            id: manifest.job_id,
            disc_type: manifest.disc_type,
            disc_name: manifest.disc_name,
            started_at: manifest.started_at,
            wip,
            output_dir: output_dir.to_path_buf(),
            status: JobStatus::Running,
            tasks: Vec::new(),
            owns_drive,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, JobStatus::Running)
    }

    pub fn failed_tasks(&self) -> Vec<TaskFailure> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| TaskFailure {
                title: t.title,
                error: t.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            })
            .collect()
    }
}
