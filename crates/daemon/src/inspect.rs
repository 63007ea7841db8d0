//! Disc inspection through system tools (blkid, mount, cdparanoia).

use crate::classify::{
    parse_blkid, parse_cdparanoia_toc, AudioToc, DiscInspector, FilesystemInfo, InspectError,
};
use crate::process::{run_capture, run_with_sudo_fallback, ToolError};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// blkid exits with 2 when the device carries no recognizable signature
const BLKID_NOTHING_FOUND: i32 = 2;

/// Inspector backed by the usual Linux command-line tools
#[derive(Debug, Clone)]
pub struct SystemInspector {
    /// Directory under which the disc is temporarily mounted
    mount_root: PathBuf,
    use_sudo: bool,
    query_timeout: Duration,
    grace: Duration,
}

impl SystemInspector {
    pub fn new(mount_root: PathBuf, use_sudo: bool, grace: Duration) -> Self {
        Self {
            mount_root,
            use_sudo,
            query_timeout: Duration::from_secs(60),
            grace,
        }
    }

    fn mount_point(&self, device: &Path) -> PathBuf {
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "drive".to_string());
        self.mount_root.join(name)
    }
}

/// Check a mounted filesystem for a DVD-Video structure
pub fn contains_video_ts(root: &Path) -> bool {
    ["VIDEO_TS", "video_ts"]
        .iter()
        .any(|name| root.join(name).is_dir())
}

#[async_trait]
impl DiscInspector for SystemInspector {
    async fn filesystem(&self, device: &Path) -> Result<Option<FilesystemInfo>, InspectError> {
        let mut cmd = Command::new("blkid");
        cmd.arg(device);
        match run_capture(cmd, self.query_timeout).await {
            Ok(output) => Ok(parse_blkid(&output, device)),
            Err(ToolError::Failed { code, .. }) if code == BLKID_NOTHING_FOUND => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn has_video_ts(&self, device: &Path) -> Result<bool, InspectError> {
        let mount_point = self.mount_point(device);
        tokio::fs::create_dir_all(&mount_point).await?;

        // mount/umount must finish even during shutdown
        let token = CancellationToken::new();
        run_with_sudo_fallback(
            "mount",
            [
                OsStr::new("-o"),
                OsStr::new("ro"),
                device.as_os_str(),
                mount_point.as_os_str(),
            ],
            self.use_sudo,
            &token,
            self.grace,
        )
        .await?;

        let found = contains_video_ts(&mount_point);
        debug!(device = %device.display(), found, "Checked for VIDEO_TS");

        if let Err(e) = run_with_sudo_fallback(
            "umount",
            [mount_point.as_os_str()],
            self.use_sudo,
            &token,
            self.grace,
        )
        .await
        {
            warn!(mount_point = %mount_point.display(), error = %e, "Failed to unmount disc");
        }

        Ok(found)
    }

    async fn audio_toc(&self, device: &Path) -> Result<Option<AudioToc>, InspectError> {
        let mut cmd = Command::new("cdparanoia");
        cmd.arg("-d").arg(device).arg("-Q");
        match run_capture(cmd, self.query_timeout).await {
            Ok(output) => Ok(parse_cdparanoia_toc(&output)),
            Err(ToolError::Failed { .. }) => {
                debug!(device = %device.display(), "No redbook disc detected");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
