//! DVD pipeline: title extraction, then the transcode fan-out.
//!
//! Transcoding starts only once every extracted title is finalized on disk,
//! and the transcoded set is promoted only if every title succeeded.

use super::{PipelineContext, StagedArtifact};
use crate::job::{Job, JobError, Task};
use crate::stability::check_files_stable;
use crate::transcode::TranscodeFanout;
use crate::wip::WipStage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RIP_DIR: &str = "rip";
const TRANSCODE_DIR: &str = "transcode";

/// Extracted title files in `rip_dir`, sorted by name
pub fn list_titles(rip_dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    let mut titles: Vec<PathBuf> = std::fs::read_dir(rip_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("mkv"))
                    .unwrap_or(false)
        })
        .collect();
    titles.sort();
    Ok(titles)
}

/// One Task per title, numbered from 1 in name order
pub fn build_tasks(titles: &[PathBuf], transcode_dir: &Path, extension: &str) -> Vec<Task> {
    titles
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let stem = source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("title_{:02}", i));
            let target = transcode_dir.join(format!("{}.{}", stem, extension));
            Task::new(i + 1, source.clone(), target)
        })
        .collect()
}

async fn finalized_titles(rip_dir: &Path, wait: Duration) -> Result<Vec<PathBuf>, JobError> {
    let titles = list_titles(rip_dir)?;
    if titles.is_empty() {
        return Err(JobError::Verification("no titles were extracted".to_string()));
    }

    let unstable = check_files_stable(&titles, wait).await?;
    if !unstable.is_empty() {
        let names: Vec<String> = unstable
            .iter()
            .map(|u| u.path.display().to_string())
            .collect();
        return Err(JobError::Verification(format!(
            "titles not finalized on disk: {}",
            names.join(", ")
        )));
    }
    Ok(titles)
}

/// Stage 1: extract every title and wait until all are finalized
pub async fn extract(
    ctx: &PipelineContext,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<(), JobError> {
    let rip_dir = job.wip.subdir(RIP_DIR)?;
    info!(disc = %job.disc_name, "Extracting DVD titles");
    ctx.toolchain
        .extract_titles(&ctx.device, &rip_dir, cancel)
        .await?;

    let titles = finalized_titles(&rip_dir, ctx.stability_wait).await?;
    job.wip.set_stage(WipStage::Extracted)?;

    let transcode_dir = job.wip.subdir(TRANSCODE_DIR)?;
    job.tasks = build_tasks(&titles, &transcode_dir, &ctx.output_extension);
    info!(disc = %job.disc_name, titles = job.tasks.len(), "Titles extracted");
    Ok(())
}

/// Stage 2: transcode every title; all must succeed
///
/// Recovered Jobs arrive without Tasks and rebuild them from the titles
/// already in WIP.
pub async fn transcode(
    ctx: &PipelineContext,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<StagedArtifact, JobError> {
    let transcode_dir = job.wip.subdir(TRANSCODE_DIR)?;
    if job.tasks.is_empty() {
        let rip_dir = job.wip.path().join(RIP_DIR);
        let titles = finalized_titles(&rip_dir, Duration::ZERO).await?;
        job.tasks = build_tasks(&titles, &transcode_dir, &ctx.output_extension);
        info!(disc = %job.disc_name, titles = job.tasks.len(), "Resuming transcode");
    }
    job.wip.set_stage(WipStage::Transcoding)?;

    let fanout = TranscodeFanout::new(ctx.toolchain.clone(), ctx.max_transcodes);
    let tasks = std::mem::take(&mut job.tasks);
    job.tasks = fanout.run(tasks, cancel).await;

    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    let failures = job.failed_tasks();
    if !failures.is_empty() {
        return Err(JobError::TasksFailed {
            total: job.tasks.len(),
            failures,
        });
    }

    for task in &job.tasks {
        let size = match tokio::fs::metadata(&task.target).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(title = task.title, error = %e, "Transcoded title missing");
                0
            }
        };
        if size == 0 {
            return Err(JobError::Verification(format!(
                "title {} produced no output at {}",
                task.title,
                task.target.display()
            )));
        }
    }

    Ok(StagedArtifact {
        source: transcode_dir,
        stem: job.disc_name.clone(),
        extension: None,
    })
}
