//! Data disc pipeline: whole-device image into an ISO.

use super::{PipelineContext, StagedArtifact};
use crate::job::{Job, JobError};
use crate::wip::WipStage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Compare the image size with the device capacity
///
/// A capacity of `None` (unreadable) only checks for an empty image.
pub fn verify_image_size(image_bytes: u64, capacity: Option<u64>) -> Result<(), JobError> {
    if image_bytes == 0 {
        return Err(JobError::Verification("image file is empty".to_string()));
    }
    match capacity {
        Some(capacity) if capacity != image_bytes => Err(JobError::Verification(format!(
            "image is {} bytes but the device reports {}",
            image_bytes, capacity
        ))),
        _ => Ok(()),
    }
}

pub async fn rip(
    ctx: &PipelineContext,
    job: &mut Job,
    cancel: &CancellationToken,
) -> Result<StagedArtifact, JobError> {
    let image = job.wip.path().join(format!("{}.iso", job.disc_name));
    info!(disc = %job.disc_name, image = %image.display(), "Extracting disc image");
    ctx.toolchain
        .extract_image(&ctx.device, &image, cancel)
        .await?;

    let image_bytes = tokio::fs::metadata(&image).await?.len();
    let capacity = match ctx.probe.capacity(&ctx.device).await {
        Ok(capacity) => Some(capacity),
        Err(e) => {
            warn!(device = %ctx.device.display(), error = %e, "Device capacity unknown; skipping size check");
            None
        }
    };
    verify_image_size(image_bytes, capacity)?;
    job.wip.set_stage(WipStage::Extracted)?;

    Ok(StagedArtifact {
        source: image,
        stem: job.disc_name.clone(),
        extension: Some("iso".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DiscType;
    use crate::testing::{pipeline_context, FakeDrive, FakeToolchain};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_verify_image_size() {
        assert!(verify_image_size(2048, Some(2048)).is_ok());
        assert!(verify_image_size(2048, None).is_ok());
        assert!(matches!(
            verify_image_size(0, None),
            Err(JobError::Verification(_))
        ));
        assert!(matches!(
            verify_image_size(1024, Some(2048)),
            Err(JobError::Verification(_))
        ));
    }

    #[tokio::test]
    async fn test_rip_stages_iso() {
        let wip_root = TempDir::new().unwrap();
        let toolchain = FakeToolchain::new().with_image_bytes(4096);
        let ctx = pipeline_context(Arc::new(toolchain), Arc::new(FakeDrive::ready_with_capacity(4096)));
        let mut job = Job::start(
            wip_root.path(),
            DiscType::DataFilesystem,
            "BACKUP01",
            Path::new("/out/iso"),
        )
        .unwrap();

        let staged = rip(&ctx, &mut job, &CancellationToken::new()).await.unwrap();
        assert_eq!(staged.stem, "BACKUP01");
        assert_eq!(staged.extension.as_deref(), Some("iso"));
        assert_eq!(staged.source, job.wip.path().join("BACKUP01.iso"));
        assert_eq!(job.wip.manifest().stage, WipStage::Extracted);
    }

    #[tokio::test]
    async fn test_rip_rejects_short_image() {
        let wip_root = TempDir::new().unwrap();
        let toolchain = FakeToolchain::new().with_image_bytes(1000);
        let ctx = pipeline_context(Arc::new(toolchain), Arc::new(FakeDrive::ready_with_capacity(4096)));
        let mut job = Job::start(
            wip_root.path(),
            DiscType::DataFilesystem,
            "BACKUP01",
            Path::new("/out/iso"),
        )
        .unwrap();

        let result = rip(&ctx, &mut job, &CancellationToken::new()).await;
        assert!(matches!(result, Err(JobError::Verification(_))));
    }
}
