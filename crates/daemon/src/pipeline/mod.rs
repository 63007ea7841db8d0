//! Per-type ripping pipelines.
//!
//! Each pipeline stages its output inside the Job's WIP directory and hands
//! back a [`StagedArtifact`]; promotion into the output tree happens only
//! after the whole pipeline reported success.

pub mod audio;
pub mod data;
pub mod dvd;

use crate::classify::{DiscMetadata, DiscType};
use crate::drive::DriveProbe;
use crate::job::{Job, JobError};
use crate::metrics::available_space;
use crate::output::{promote_unique, sanitize_name};
use crate::tools::Toolchain;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything a pipeline needs besides the Job itself
#[derive(Clone)]
pub struct PipelineContext {
    pub device: PathBuf,
    pub toolchain: Arc<dyn Toolchain>,
    pub probe: Arc<dyn DriveProbe>,
    pub max_transcodes: usize,
    /// Window extracted titles must stay unchanged before transcoding
    pub stability_wait: Duration,
    pub output_extension: String,
}

/// A finished artifact inside WIP, waiting for promotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    /// File or directory inside the Job's WIP directory
    pub source: PathBuf,
    /// Name in the output subtree, without extension
    pub stem: String,
    pub extension: Option<String>,
}

/// Outcome of the ripping stage
#[derive(Debug)]
pub enum RipOutcome {
    /// Single-stage pipeline finished; ready for promotion
    Staged(StagedArtifact),
    /// Titles extracted and finalized; transcode fan-out comes next
    NeedsTranscode,
}

/// Run the ripping stage selected by the Job's disc type
pub async fn rip(
    ctx: &PipelineContext,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<RipOutcome, JobError> {
    match job.disc_type {
        DiscType::DataFilesystem => data::rip(ctx, job, cancel).await.map(RipOutcome::Staged),
        DiscType::AudioCd => audio::rip(ctx, job, cancel).await.map(RipOutcome::Staged),
        DiscType::DvdVideo => dvd::extract(ctx, job, cancel)
            .await
            .map(|()| RipOutcome::NeedsTranscode),
        DiscType::Unknown => Err(JobError::Verification(
            "no pipeline for unknown discs".to_string(),
        )),
    }
}

/// Move a staged artifact into the Job's output subtree
pub fn promote(job: &Job, artifact: &StagedArtifact) -> Result<PathBuf, JobError> {
    let dest = promote_unique(
        &artifact.source,
        &job.output_dir,
        &artifact.stem,
        artifact.extension.as_deref(),
    )?;
    info!(
        disc = %job.disc_name,
        from = %artifact.source.display(),
        to = %dest.display(),
        "Promoted artifact"
    );
    Ok(dest)
}

/// Identifier for a disc, used for naming and skip detection
///
/// Data discs use the volume label (then UUID, then a timestamp); DVDs use
/// `LABEL-UUID`; audio discs use the 8-hex-digit TOC fingerprint.
pub fn disc_identity(disc_type: DiscType, meta: &DiscMetadata) -> String {
    let fs = meta.filesystem.as_ref();
    let label = fs.and_then(|f| f.label.as_deref()).filter(|l| !l.trim().is_empty());
    let uuid = fs.and_then(|f| f.uuid.as_deref()).filter(|u| !u.trim().is_empty());
    let fallback = || format!("{}-{}", disc_type, Local::now().format("%Y%m%d-%H%M%S"));

    let raw = match disc_type {
        DiscType::DataFilesystem => label.or(uuid).map(str::to_string).unwrap_or_else(fallback),
        DiscType::DvdVideo => match (label, uuid) {
            (Some(label), Some(uuid)) => format!("{}-{}", label, uuid),
            (Some(label), None) => label.to_string(),
            (None, Some(uuid)) => format!("DVD-{}", uuid),
            (None, None) => fallback(),
        },
        DiscType::AudioCd => meta
            .audio_toc
            .as_ref()
            .map(|toc| toc.fingerprint())
            .unwrap_or_else(fallback),
        DiscType::Unknown => fallback(),
    };
    sanitize_name(&raw)
}

/// Refuse to start a Job when the WIP filesystem is nearly full
///
/// Unknown free space (no matching disk) does not block the Job.
pub fn check_free_space(wip_root: &Path, min_free_bytes: u64) -> Result<Option<u64>, JobError> {
    let free = available_space(wip_root);
    match free {
        Some(free) if free < min_free_bytes => Err(JobError::ResourceExhausted(format!(
            "{} has {} bytes free, {} required",
            wip_root.display(),
            free,
            min_free_bytes
        ))),
        Some(free) => {
            debug!(wip_root = %wip_root.display(), free, "Free space check passed");
            Ok(Some(free))
        }
        None => Ok(None),
    }
}
