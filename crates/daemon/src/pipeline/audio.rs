//! Redbook pipeline: the audio toolchain rips, tags and encodes; we only
//! stage, check and promote the album as a unit.

use super::{PipelineContext, StagedArtifact};
use crate::job::{Job, JobError};
use crate::output::sanitize_name;
use crate::wip::WipStage;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// abcde keeps its scratch state in `abcde.*` directories
const TOOL_SCRATCH_PREFIX: &str = "abcde.";

/// Locate the single album directory the toolchain produced
///
/// Returns the directory and the number of files in it.
pub fn find_album_dir(rip_dir: &Path) -> Result<(PathBuf, usize), JobError> {
    let mut albums = Vec::new();
    for entry in std::fs::read_dir(rip_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(TOOL_SCRATCH_PREFIX) || name.starts_with('.') {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let tracks = std::fs::read_dir(entry.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count();
        if tracks > 0 {
            albums.push((entry.path(), tracks));
        }
    }

    match albums.len() {
        1 => Ok(albums.remove(0)),
        0 => Err(JobError::Verification(
            "audio toolchain produced no tracks".to_string(),
        )),
        n => Err(JobError::Verification(format!(
            "audio toolchain produced {} album directories",
            n
        ))),
    }
}

pub async fn rip(
    ctx: &PipelineContext,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<StagedArtifact, JobError> {
    let rip_dir = job.wip.subdir("rip")?;
    info!(disc = %job.disc_name, workdir = %rip_dir.display(), "Ripping audio disc");
    ctx.toolchain.rip_audio(&ctx.device, &rip_dir, cancel).await?;

    let (album, tracks) = find_album_dir(&rip_dir)?;
    let album_name = album
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "album".to_string());
    info!(disc = %job.disc_name, album = %album_name, tracks, "Audio rip complete");
    job.wip.set_stage(WipStage::Extracted)?;

    Ok(StagedArtifact {
        source: album,
        stem: format!("{}-{}", sanitize_name(&album_name), job.disc_name),
        extension: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DiscType;
    use crate::process::ToolError;
    use crate::testing::{pipeline_context, FakeDrive, FakeToolchain};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_find_album_dir_skips_scratch() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("abcde.4f0c2a10")).unwrap();
        std::fs::write(dir.path().join("abcde.4f0c2a10").join("status"), b"x").unwrap();
        let album = dir.path().join("Artist-Album");
        std::fs::create_dir(&album).unwrap();
        std::fs::write(album.join("01.Intro.flac"), b"1").unwrap();
        std::fs::write(album.join("02.Song.flac"), b"2").unwrap();

        let (found, tracks) = find_album_dir(dir.path()).unwrap();
        assert_eq!(found, album);
        assert_eq!(tracks, 2);
    }

    #[test]
    fn test_find_album_dir_requires_tracks() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Empty-Album")).unwrap();
        assert!(matches!(
            find_album_dir(dir.path()),
            Err(JobError::Verification(_))
        ));
    }

    #[tokio::test]
    async fn test_rip_names_album_with_toc_hash() {
        let wip_root = TempDir::new().unwrap();
        let toolchain = FakeToolchain::new().with_album("Artist-Album", 10);
        let ctx = pipeline_context(Arc::new(toolchain), Arc::new(FakeDrive::ready()));
        let mut job = Job::start(
            wip_root.path(),
            DiscType::AudioCd,
            "1a2b3c4d",
            Path::new("/out/redbook"),
        )
        .unwrap();

        let staged = rip(&ctx, &mut job, &CancellationToken::new()).await.unwrap();
        assert_eq!(staged.stem, "Artist-Album-1a2b3c4d");
        assert_eq!(staged.extension, None);
        assert_eq!(std::fs::read_dir(&staged.source).unwrap().count(), 10);
    }

    #[tokio::test]
    async fn test_toolchain_failure_fails_job() {
        let wip_root = TempDir::new().unwrap();
        let toolchain = FakeToolchain::new()
            .with_album("Artist-Album", 4)
            .failing_audio();
        let ctx = pipeline_context(Arc::new(toolchain), Arc::new(FakeDrive::ready()));
        let mut job = Job::start(
            wip_root.path(),
            DiscType::AudioCd,
            "1a2b3c4d",
            Path::new("/out/redbook"),
        )
        .unwrap();

        let result = rip(&ctx, &mut job, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(JobError::Tool(ToolError::Failed { .. }))
        ));
    }
}
