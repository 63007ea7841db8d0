//! External ripping and encoding tools

pub mod abcde;
pub mod dd;
pub mod ffmpeg;
pub mod makemkv;

pub use abcde::build_abcde_command;
pub use dd::build_dd_command;
pub use ffmpeg::build_ffmpeg_command;
pub use makemkv::{build_makemkv_command, update_makemkv_key, MakeMkvKeyError};

use crate::config::{Config, MakeMkvConfig};
use crate::process::{run_tool, ToolError};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The four black-box tools the pipelines drive
///
/// Every call blocks until the tool has exited and been reaped.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Copy the whole device into a single image file
    async fn extract_image(
        &self,
        device: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Rip, tag and encode every audio track into `workdir`
    async fn rip_audio(
        &self,
        device: &Path,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Extract every title of a DVD into `out_dir`, one file per title
    async fn extract_titles(
        &self,
        device: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Transcode one title file
    async fn transcode(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

/// Toolchain running dd, abcde, makemkvcon and ffmpeg
#[derive(Debug, Clone)]
pub struct SystemToolchain {
    ffmpeg_args: Vec<String>,
    makemkv: MakeMkvConfig,
    grace: Duration,
}

impl SystemToolchain {
    pub fn new(ffmpeg_args: Vec<String>, makemkv: MakeMkvConfig, grace: Duration) -> Self {
        Self {
            ffmpeg_args,
            makemkv,
            grace,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.transcode.ffmpeg_args.clone(),
            cfg.makemkv.clone(),
            Duration::from_secs(cfg.process.termination_grace_secs),
        )
    }
}

#[async_trait]
impl Toolchain for SystemToolchain {
    async fn extract_image(
        &self,
        device: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        run_tool(build_dd_command(device, target), cancel, self.grace).await
    }

    async fn rip_audio(
        &self,
        device: &Path,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        run_tool(build_abcde_command(device, workdir), cancel, self.grace).await
    }

    async fn extract_titles(
        &self,
        device: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        if self.makemkv.update_key {
            // an expired key makes makemkvcon fail loudly on its own
            match update_makemkv_key(&self.makemkv, cancel).await {
                Ok(()) => {}
                Err(MakeMkvKeyError::Cancelled) => {
                    return Err(ToolError::Cancelled {
                        tool: "makemkvcon".to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "MakeMKV key update failed, continuing with existing key")
                }
            }
        }
        run_tool(build_makemkv_command(device, out_dir), cancel, self.grace).await
    }

    async fn transcode(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let cmd = build_ffmpeg_command(source, target, &self.ffmpeg_args);
        run_tool(cmd, cancel, self.grace).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::process::Command;

    /// Helper to convert Command args to a Vec of strings for easier testing
    pub fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    pub fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    /// Helper to check if args contain a standalone flag
    pub fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }
}
