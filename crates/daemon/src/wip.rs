//! Work-in-progress staging directories.
//!
//! Every Job owns exactly one directory under the WIP root, named
//! `{type}-{timestamp}-{token}` and created with `create_dir` so two Jobs can
//! never share a path. A `job.json` manifest records how far the Job got,
//! which is what the startup sweep uses to decide between resuming and
//! discarding a leftover directory.

use crate::classify::DiscType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Manifest file name inside every WIP directory
pub const MANIFEST_FILE: &str = "job.json";

/// Error type for WIP directory handling
#[derive(Debug, Error)]
pub enum WipError {
    #[error("Failed to create WIP directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid manifest in {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("WIP IO error: {0}")]
    Io(#[from] io::Error),
}

/// How far a Job got before its process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipStage {
    /// Tool is writing into the directory
    Ripping,
    /// Extraction finished and every output is finalized on disk
    Extracted,
    /// Transcode fan-out running
    Transcoding,
    /// Job failed; the directory is garbage
    Failed,
}

impl std::fmt::Display for WipStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WipStage::Ripping => write!(f, "ripping"),
            WipStage::Extracted => write!(f, "extracted"),
            WipStage::Transcoding => write!(f, "transcoding"),
            WipStage::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted description of a WIP directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WipManifest {
    pub job_id: Uuid,
    pub disc_type: DiscType,
    /// Disc identifier used for the promoted artifact
    pub disc_name: String,
    pub started_at: DateTime<Utc>,
    pub stage: WipStage,
}

impl WipManifest {
    /// Only DVD jobs whose extraction completed can pick up where they left off
    pub fn is_resumable(&self) -> bool {
        self.disc_type == DiscType::DvdVideo
            && matches!(self.stage, WipStage::Extracted | WipStage::Transcoding)
    }
}

/// Directory name for a new Job
pub fn wip_dir_name(disc_type: DiscType, started_at: DateTime<Utc>, job_id: Uuid) -> String {
    let token = job_id.simple().to_string();
    format!(
        "{}-{}-{}",
        disc_type,
        started_at.format("%Y%m%dT%H%M%S"),
        &token[..8]
    )
}

/// A WIP directory owned by one Job
#[derive(Debug)]
pub struct WipDir {
    path: PathBuf,
    manifest: WipManifest,
}

impl WipDir {
    /// Create a fresh directory under `root` and write its manifest
    pub fn create(root: &Path, disc_type: DiscType, disc_name: &str) -> Result<Self, WipError> {
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        let path = root.join(wip_dir_name(disc_type, started_at, job_id));

        fs::create_dir(&path).map_err(|source| WipError::Create {
            path: path.clone(),
            source,
        })?;

        let wip = Self {
            path,
            manifest: WipManifest {
                job_id,
                disc_type,
                disc_name: disc_name.to_string(),
                started_at,
                stage: WipStage::Ripping,
            },
        };
        wip.write_manifest()?;
        debug!(path = %wip.path.display(), "Created WIP directory");
        Ok(wip)
    }

    /// Reopen a directory left behind by an earlier run
    pub fn open(path: &Path) -> Result<Self, WipError> {
        let manifest_path = path.join(MANIFEST_FILE);
        let content = fs::read_to_string(&manifest_path)?;
        let manifest = serde_json::from_str(&content).map_err(|source| WipError::Manifest {
            path: manifest_path,
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &WipManifest {
        &self.manifest
    }

    /// Create (if needed) and return a subdirectory
    pub fn subdir(&self, name: &str) -> Result<PathBuf, WipError> {
        let dir = self.path.join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Record a new stage in the manifest
    pub fn set_stage(&mut self, stage: WipStage) -> Result<(), WipError> {
        self.manifest.stage = stage;
        self.write_manifest()
    }

    fn write_manifest(&self) -> Result<(), WipError> {
        let target = self.path.join(MANIFEST_FILE);
        let tmp = self.path.join(format!("{}.tmp", MANIFEST_FILE));
        let json = serde_json::to_string_pretty(&self.manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Delete the directory and everything in it
    pub fn remove(self) -> Result<(), WipError> {
        fs::remove_dir_all(&self.path)?;
        debug!(path = %self.path.display(), "Removed WIP directory");
        Ok(())
    }
}

/// What the startup sweep did with leftovers
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Directories to resume, oldest first
    pub resumable: Vec<WipDir>,
    pub discarded: Vec<PathBuf>,
    /// Directories that could not be removed; retried on the next sweep
    pub flagged: Vec<PathBuf>,
}

/// Resume or discard every Job directory left under `root`
///
/// Hidden entries (the inspection mount point, temp files) are ignored.
pub fn sweep(root: &Path, resume_interrupted: bool) -> Result<SweepReport, WipError> {
    let mut report = SweepReport::default();
    let mut entries: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    entries.sort();

    for path in entries {
        if !path.is_dir() {
            continue;
        }

        if resume_interrupted {
            match WipDir::open(&path) {
                Ok(wip) if wip.manifest().is_resumable() => {
                    info!(
                        path = %path.display(),
                        disc = %wip.manifest().disc_name,
                        stage = %wip.manifest().stage,
                        "Found resumable WIP directory"
                    );
                    report.resumable.push(wip);
                    continue;
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Unreadable WIP manifest"),
            }
        }

        match fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Discarded leftover WIP directory");
                report.discarded.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to discard WIP directory");
                report.flagged.push(path);
            }
        }
    }

    report
        .resumable
        .sort_by_key(|wip| wip.manifest().started_at);
    Ok(report)
}
