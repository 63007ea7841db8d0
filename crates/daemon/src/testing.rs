//! In-memory fakes for the hardware and tool seams.

use crate::classify::{AudioToc, DiscInspector, FilesystemInfo, InspectError};
use crate::drive::{DriveError, DriveProbe, DriveState};
use crate::eject::{EjectError, Ejector};
use crate::pipeline::PipelineContext;
use crate::process::ToolError;
use crate::tools::Toolchain;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn failed(tool: &str) -> ToolError {
    ToolError::Failed {
        tool: tool.to_string(),
        code: 1,
    }
}

/// Drive that replays a script of states, then repeats the last one
pub struct FakeDrive {
    states: Mutex<VecDeque<Option<DriveState>>>,
    last: Mutex<Option<DriveState>>,
    capacity: Option<u64>,
}

impl FakeDrive {
    pub fn scripted(states: Vec<DriveState>) -> Self {
        let last = states.last().copied();
        Self {
            states: Mutex::new(states.into_iter().map(Some).collect()),
            last: Mutex::new(last),
            capacity: None,
        }
    }

    pub fn ready() -> Self {
        Self::scripted(vec![DriveState::DiscPresentReady])
    }

    pub fn ready_with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::ready()
        }
    }

    /// Every status query errors
    pub fn failing() -> Self {
        Self {
            states: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            capacity: None,
        }
    }
}

#[async_trait]
impl DriveProbe for FakeDrive {
    async fn status(&self, _device: &Path) -> Result<DriveState, DriveError> {
        let next = self.states.lock().unwrap().pop_front();
        let state = match next {
            Some(state) => {
                *self.last.lock().unwrap() = state;
                state
            }
            None => *self.last.lock().unwrap(),
        };
        state.ok_or_else(|| DriveError::Query(std::io::Error::other("no medium information")))
    }

    async fn capacity(&self, _device: &Path) -> Result<u64, DriveError> {
        self.capacity.ok_or(DriveError::Unsupported)
    }
}

/// Inspector returning fixed metadata
pub struct FakeInspector {
    filesystem: Option<FilesystemInfo>,
    video_ts: bool,
    toc: Option<AudioToc>,
    audio_probes: AtomicUsize,
}

impl FakeInspector {
    pub fn new(filesystem: Option<FilesystemInfo>, video_ts: bool, toc: Option<AudioToc>) -> Self {
        Self {
            filesystem,
            video_ts,
            toc,
            audio_probes: AtomicUsize::new(0),
        }
    }

    pub fn data(label: &str) -> Self {
        Self::new(Some(filesystem(label, "2019-07-01-12-00-00-00")), false, None)
    }

    pub fn dvd(label: &str, uuid: &str) -> Self {
        Self::new(Some(filesystem(label, uuid)), true, None)
    }

    pub fn audio(tracks: usize) -> Self {
        let toc = AudioToc {
            track_sectors: (0..tracks as u64).map(|i| 15_000 + i * 731).collect(),
        };
        Self::new(None, false, Some(toc))
    }

    pub fn blank() -> Self {
        Self::new(None, false, None)
    }

    pub fn audio_probes(&self) -> usize {
        self.audio_probes.load(Ordering::SeqCst)
    }
}

pub fn filesystem(label: &str, uuid: &str) -> FilesystemInfo {
    FilesystemInfo {
        fs_type: Some("iso9660".to_string()),
        label: Some(label.to_string()),
        uuid: Some(uuid.to_string()),
    }
}

#[async_trait]
impl DiscInspector for FakeInspector {
    async fn filesystem(&self, _device: &Path) -> Result<Option<FilesystemInfo>, InspectError> {
        Ok(self.filesystem.clone())
    }

    async fn has_video_ts(&self, _device: &Path) -> Result<bool, InspectError> {
        Ok(self.video_ts)
    }

    async fn audio_toc(&self, _device: &Path) -> Result<Option<AudioToc>, InspectError> {
        self.audio_probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.toc.clone())
    }
}

/// Toolchain writing plausible output files instead of touching hardware
#[derive(Debug, Clone)]
pub struct FakeToolchain {
    image_bytes: u64,
    album: (String, usize),
    fail_audio: bool,
    titles: usize,
    fail_extract: bool,
    failing_sources: Vec<String>,
    transcode_delay: Duration,
    transcodes: Arc<AtomicUsize>,
}

impl Default for FakeToolchain {
    fn default() -> Self {
        Self {
            image_bytes: 2048,
            album: ("Artist-Album".to_string(), 10),
            fail_audio: false,
            titles: 1,
            fail_extract: false,
            failing_sources: Vec::new(),
            transcode_delay: Duration::ZERO,
            transcodes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image_bytes(mut self, bytes: u64) -> Self {
        self.image_bytes = bytes;
        self
    }

    pub fn with_album(mut self, name: &str, tracks: usize) -> Self {
        self.album = (name.to_string(), tracks);
        self
    }

    /// The audio toolchain writes its tracks, then exits non-zero
    pub fn failing_audio(mut self) -> Self {
        self.fail_audio = true;
        self
    }

    pub fn with_titles(mut self, titles: usize) -> Self {
        self.titles = titles;
        self
    }

    pub fn failing_extract(mut self) -> Self {
        self.fail_extract = true;
        self
    }

    /// Transcodes whose source path contains `pattern` exit non-zero
    pub fn failing_transcode_for(mut self, pattern: &str) -> Self {
        self.failing_sources.push(pattern.to_string());
        self
    }

    pub fn with_transcode_delay(mut self, delay: Duration) -> Self {
        self.transcode_delay = delay;
        self
    }

    pub fn transcodes(&self) -> usize {
        self.transcodes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn extract_image(
        &self,
        _device: &Path,
        target: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let file = std::fs::File::create(target).map_err(|source| ToolError::Io {
            tool: "dd".to_string(),
            source,
        })?;
        file.set_len(self.image_bytes).map_err(|source| ToolError::Io {
            tool: "dd".to_string(),
            source,
        })?;
        Ok(())
    }

    async fn rip_audio(
        &self,
        _device: &Path,
        workdir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        let io = |source| ToolError::Io {
            tool: "abcde".to_string(),
            source,
        };
        let scratch = workdir.join("abcde.0a1b2c3d");
        std::fs::create_dir_all(&scratch).map_err(io)?;
        let album = workdir.join(&self.album.0);
        std::fs::create_dir_all(&album).map_err(io)?;
        for track in 1..=self.album.1 {
            std::fs::write(album.join(format!("{:02}.Track.flac", track)), b"fLaC").map_err(io)?;
        }
        if self.fail_audio {
            return Err(failed("abcde"));
        }
        Ok(())
    }

    async fn extract_titles(
        &self,
        _device: &Path,
        out_dir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        if self.fail_extract {
            return Err(failed("makemkvcon"));
        }
        for title in 0..self.titles {
            std::fs::write(out_dir.join(format!("title_t{:02}.mkv", title)), b"matroska")
                .map_err(|source| ToolError::Io {
                    tool: "makemkvcon".to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn transcode(
        &self,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        self.transcodes.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.transcode_delay) => {}
            _ = cancel.cancelled() => {
                return Err(ToolError::Cancelled { tool: "ffmpeg".to_string() });
            }
        }

        let source_name = source.to_string_lossy();
        if self
            .failing_sources
            .iter()
            .any(|pattern| source_name.contains(pattern.as_str()))
        {
            return Err(failed("ffmpeg"));
        }
        std::fs::write(target, b"mp4").map_err(|source| ToolError::Io {
            tool: "ffmpeg".to_string(),
            source,
        })
    }
}

/// Ejector recording every call
#[derive(Default)]
pub struct RecordingEjector {
    calls: Mutex<Vec<(PathBuf, bool)>>,
    fail: bool,
}

impl RecordingEjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ejector for RecordingEjector {
    async fn eject(&self, device: &Path, force: bool) -> Result<(), EjectError> {
        self.calls.lock().unwrap().push((device.to_path_buf(), force));
        if self.fail {
            return Err(EjectError::Tool(failed("eject")));
        }
        Ok(())
    }
}

/// Pipeline context on `/dev/sr0` with two transcode slots and no stability wait
pub fn pipeline_context(toolchain: Arc<dyn Toolchain>, probe: Arc<dyn DriveProbe>) -> PipelineContext {
    PipelineContext {
        device: PathBuf::from("/dev/sr0"),
        toolchain,
        probe,
        max_transcodes: 2,
        stability_wait: Duration::ZERO,
        output_extension: "mp4".to_string(),
    }
}
