//! Disc classifier.
//!
//! Gathers drive metadata through a [`DiscInspector`] (filesystem table first,
//! audio TOC only when it can change the answer) and resolves it to a
//! [`DiscType`] with a configurable priority order. The resolution itself is a
//! pure function of the gathered [`DiscMetadata`].

use crate::config::{ClassifyConfig, ConfigError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Kind of disc in the drive, fixed for one insertion cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscType {
    /// No known layout
    Unknown,
    /// Plain data filesystem, ripped to an ISO image
    DataFilesystem,
    /// Redbook audio
    AudioCd,
    /// DVD-Video (filesystem with a VIDEO_TS directory)
    DvdVideo,
}

impl Default for DiscType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for DiscType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscType::Unknown => write!(f, "unknown"),
            DiscType::DataFilesystem => write!(f, "data"),
            DiscType::AudioCd => write!(f, "audio"),
            DiscType::DvdVideo => write!(f, "dvd"),
        }
    }
}

impl DiscType {
    /// Parse the names used in `classify.priority`
    pub fn from_priority_name(name: &str) -> Option<Self> {
        match name {
            "data" => Some(DiscType::DataFilesystem),
            "dvd" => Some(DiscType::DvdVideo),
            "audio" => Some(DiscType::AudioCd),
            _ => None,
        }
    }
}

/// Filesystem identity as reported by blkid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub fs_type: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
}

/// Audio table of contents: length of each track in sectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioToc {
    pub track_sectors: Vec<u64>,
}

impl AudioToc {
    /// Stable short identifier derived from the track lengths
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for sectors in &self.track_sectors {
            hasher.update(sectors.to_le_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    pub fn track_count(&self) -> usize {
        self.track_sectors.len()
    }
}

/// Everything the classifier learned about the inserted disc
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscMetadata {
    pub filesystem: Option<FilesystemInfo>,
    pub has_video_ts: bool,
    pub audio_toc: Option<AudioToc>,
}

impl DiscMetadata {
    /// Layouts this disc exposes, independent of priority
    pub fn candidates(&self) -> Vec<DiscType> {
        let mut found = Vec::with_capacity(2);
        if self.filesystem.is_some() {
            if self.has_video_ts {
                found.push(DiscType::DvdVideo);
            } else {
                found.push(DiscType::DataFilesystem);
            }
        }
        if self
            .audio_toc
            .as_ref()
            .map(|toc| toc.track_count() > 0)
            .unwrap_or(false)
        {
            found.push(DiscType::AudioCd);
        }
        found
    }
}

/// Order used to break ties when a disc exposes several layouts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyPriority(Vec<DiscType>);

impl Default for ClassifyPriority {
    fn default() -> Self {
        Self(vec![
            DiscType::DataFilesystem,
            DiscType::DvdVideo,
            DiscType::AudioCd,
        ])
    }
}

impl ClassifyPriority {
    pub fn new(order: Vec<DiscType>) -> Self {
        Self(order)
    }

    pub fn from_config(cfg: &ClassifyConfig) -> Result<Self, ConfigError> {
        let mut order = Vec::with_capacity(cfg.priority.len());
        for name in &cfg.priority {
            let disc_type = DiscType::from_priority_name(name).ok_or_else(|| {
                ConfigError::Invalid(format!("unknown classify priority '{}'", name))
            })?;
            if !order.contains(&disc_type) {
                order.push(disc_type);
            }
        }
        Ok(Self(order))
    }

    /// Rank of a type; unlisted types sort last
    pub fn rank(&self, disc_type: DiscType) -> usize {
        self.0
            .iter()
            .position(|t| *t == disc_type)
            .unwrap_or(self.0.len())
    }

    pub fn order(&self) -> &[DiscType] {
        &self.0
    }
}

/// Resolve gathered metadata to a disc type
pub fn classify(meta: &DiscMetadata, priority: &ClassifyPriority) -> DiscType {
    meta.candidates()
        .into_iter()
        .min_by_key(|t| priority.rank(*t))
        .unwrap_or(DiscType::Unknown)
}

/// Error type for disc inspection
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("Inspection tool failed: {0}")]
    Tool(#[from] crate::process::ToolError),

    #[error("IO error during inspection: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only probes of the inserted medium
#[async_trait]
pub trait DiscInspector: Send + Sync {
    /// Filesystem identity, or None when no standard filesystem is present
    async fn filesystem(&self, device: &Path) -> Result<Option<FilesystemInfo>, InspectError>;

    /// Whether the filesystem carries a DVD-Video structure
    async fn has_video_ts(&self, device: &Path) -> Result<bool, InspectError>;

    /// Audio TOC, or None when the disc has no audio tracks
    async fn audio_toc(&self, device: &Path) -> Result<Option<AudioToc>, InspectError>;
}

/// Gather metadata, cheapest probes first
///
/// The audio TOC is only read when no filesystem was found or when the
/// priority ranks audio above the detected filesystem layout. Probe errors
/// count as "layout not present".
pub async fn gather_metadata(
    inspector: &dyn DiscInspector,
    device: &Path,
    priority: &ClassifyPriority,
) -> DiscMetadata {
    let filesystem = match inspector.filesystem(device).await {
        Ok(fs) => fs,
        Err(e) => {
            warn!(device = %device.display(), error = %e, "Filesystem probe failed");
            None
        }
    };

    let has_video_ts = if filesystem.is_some() {
        match inspector.has_video_ts(device).await {
            Ok(found) => found,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "VIDEO_TS probe failed");
                false
            }
        }
    } else {
        false
    };

    let fs_type = match (&filesystem, has_video_ts) {
        (None, _) => None,
        (Some(_), true) => Some(DiscType::DvdVideo),
        (Some(_), false) => Some(DiscType::DataFilesystem),
    };

    let probe_audio = match fs_type {
        None => true,
        Some(found) => priority.rank(DiscType::AudioCd) < priority.rank(found),
    };

    let audio_toc = if probe_audio {
        match inspector.audio_toc(device).await {
            Ok(toc) => toc,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "Audio TOC probe failed");
                None
            }
        }
    } else {
        None
    };

    let meta = DiscMetadata {
        filesystem,
        has_video_ts,
        audio_toc,
    };
    debug!(?meta, "Gathered disc metadata");
    meta
}

/// Parse `KEY="value"` pairs from one line of blkid output
///
/// Values may contain spaces; they are always quoted.
pub fn parse_blkid_params(params: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = params;
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq]
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_string();
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else {
            break;
        };
        if !key.is_empty() {
            out.insert(key, after[..end].to_string());
        }
        rest = &after[end + 1..];
    }
    out
}

/// Parse blkid output for `device`
///
/// Returns None when the device line is missing or has no TYPE.
pub fn parse_blkid(output: &str, device: &Path) -> Option<FilesystemInfo> {
    let device = device.to_string_lossy();
    for line in output.lines() {
        let Some((dev, params)) = line.split_once(": ") else {
            continue;
        };
        if dev.trim() != device {
            continue;
        }
        let params = parse_blkid_params(params);
        let fs_type = params.get("TYPE").cloned();
        if fs_type.is_none() {
            return None;
        }
        return Some(FilesystemInfo {
            fs_type,
            label: params.get("LABEL").cloned(),
            uuid: params.get("UUID").cloned(),
        });
    }
    None
}

/// Parse the TOC printed by `cdparanoia -Q`
///
/// Track lines look like `  1.    16503 [03:40.03]        0 [00:00.00]    no   no  2`.
pub fn parse_cdparanoia_toc(output: &str) -> Option<AudioToc> {
    let mut track_sectors = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let Some(number) = first.strip_suffix('.') else {
            continue;
        };
        if number.parse::<u32>().is_err() {
            continue;
        }
        if let Some(length) = fields.next().and_then(|f| f.parse::<u64>().ok()) {
            track_sectors.push(length);
        }
    }
    if track_sectors.is_empty() {
        None
    } else {
        Some(AudioToc { track_sectors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeInspector;
    use proptest::prelude::*;

    const CDPARANOIA_OUTPUT: &str = r#"cdparanoia III release 10.2 (September 11, 2008)

Table of contents (audio tracks only):
track        length               begin        copy pre ch
===========================================================
  1.    16503 [03:40.03]        0 [00:00.00]    no   no  2
  2.    17575 [03:54.25]    16503 [03:40.03]    no   no  2
  3.    20217 [04:29.42]    34078 [07:34.28]    no   no  2
TOTAL   54295 [12:03.70]    (audio only)
"#;

    fn fs(label: &str) -> Option<FilesystemInfo> {
        Some(FilesystemInfo {
            fs_type: Some("iso9660".to_string()),
            label: Some(label.to_string()),
            uuid: Some("2024-01-01-00-00-00-00".to_string()),
        })
    }

    fn toc(n: usize) -> Option<AudioToc> {
        Some(AudioToc {
            track_sectors: (0..n as u64).map(|i| 15000 + i * 7).collect(),
        })
    }

    fn disc_type_strategy() -> impl Strategy<Value = DiscType> {
        prop_oneof![
            Just(DiscType::DataFilesystem),
            Just(DiscType::DvdVideo),
            Just(DiscType::AudioCd),
        ]
    }

    fn metadata_strategy() -> impl Strategy<Value = DiscMetadata> {
        (
            proptest::bool::ANY,
            proptest::bool::ANY,
            0usize..20,
            "[A-Z0-9_]{0,12}",
        )
            .prop_map(|(has_fs, video_ts, tracks, label)| DiscMetadata {
                filesystem: if has_fs { fs(&label) } else { None },
                has_video_ts: has_fs && video_ts,
                audio_toc: if tracks > 0 { toc(tracks) } else { None },
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_classification_is_deterministic(
            meta in metadata_strategy(),
            order in Just(vec![DiscType::DataFilesystem, DiscType::DvdVideo, DiscType::AudioCd]).prop_shuffle(),
        ) {
            let priority = ClassifyPriority::new(order);
            let copy = meta.clone();
            prop_assert_eq!(classify(&meta, &priority), classify(&copy, &priority));
        }

        #[test]
        fn prop_result_is_highest_ranked_candidate(
            meta in metadata_strategy(),
            order in Just(vec![DiscType::DataFilesystem, DiscType::DvdVideo, DiscType::AudioCd]).prop_shuffle(),
        ) {
            let priority = ClassifyPriority::new(order);
            let result = classify(&meta, &priority);
            let candidates = meta.candidates();
            if candidates.is_empty() {
                prop_assert_eq!(result, DiscType::Unknown);
            } else {
                prop_assert!(candidates.contains(&result));
                for c in candidates {
                    prop_assert!(priority.rank(result) <= priority.rank(c));
                }
            }
        }

        #[test]
        fn prop_single_layout_ignores_priority(
            disc_type in disc_type_strategy(),
            order in Just(vec![DiscType::DataFilesystem, DiscType::DvdVideo, DiscType::AudioCd]).prop_shuffle(),
        ) {
            let meta = match disc_type {
                DiscType::DataFilesystem => DiscMetadata { filesystem: fs("DATA"), ..Default::default() },
                DiscType::DvdVideo => DiscMetadata { filesystem: fs("MOVIE"), has_video_ts: true, ..Default::default() },
                _ => DiscMetadata { audio_toc: toc(10), ..Default::default() },
            };
            prop_assert_eq!(classify(&meta, &ClassifyPriority::new(order)), disc_type);
        }
    }

    #[test]
    fn test_default_priority_prefers_data_over_audio() {
        let meta = DiscMetadata {
            filesystem: fs("ENHANCED"),
            has_video_ts: false,
            audio_toc: toc(12),
        };
        assert_eq!(
            classify(&meta, &ClassifyPriority::default()),
            DiscType::DataFilesystem
        );
    }

    #[test]
    fn test_audio_first_priority() {
        let priority = ClassifyPriority::new(vec![
            DiscType::AudioCd,
            DiscType::DataFilesystem,
            DiscType::DvdVideo,
        ]);
        let meta = DiscMetadata {
            filesystem: fs("ENHANCED"),
            has_video_ts: false,
            audio_toc: toc(12),
        };
        assert_eq!(classify(&meta, &priority), DiscType::AudioCd);
    }

    #[test]
    fn test_nothing_detected_is_unknown() {
        assert_eq!(
            classify(&DiscMetadata::default(), &ClassifyPriority::default()),
            DiscType::Unknown
        );
    }

    #[test]
    fn test_priority_from_config() {
        let cfg = ClassifyConfig {
            priority: vec!["audio".to_string(), "dvd".to_string()],
        };
        let priority = ClassifyPriority::from_config(&cfg).unwrap();
        assert_eq!(priority.order(), &[DiscType::AudioCd, DiscType::DvdVideo]);
        assert_eq!(priority.rank(DiscType::DataFilesystem), 2);

        let bad = ClassifyConfig {
            priority: vec!["hddvd".to_string()],
        };
        assert!(ClassifyPriority::from_config(&bad).is_err());
    }

    #[test]
    fn test_parse_blkid() {
        let output = r#"/dev/sr0: UUID="2023-05-01-12-00-00-00" LABEL="MY BACKUP 01" TYPE="iso9660" PTUUID="4a5b" PTTYPE="PMBR""#;
        let info = parse_blkid(output, Path::new("/dev/sr0")).unwrap();
        assert_eq!(info.label.as_deref(), Some("MY BACKUP 01"));
        assert_eq!(info.uuid.as_deref(), Some("2023-05-01-12-00-00-00"));
        assert_eq!(info.fs_type.as_deref(), Some("iso9660"));
    }

    #[test]
    fn test_parse_blkid_other_device_or_empty() {
        let output = r#"/dev/sr1: LABEL="OTHER" TYPE="udf""#;
        assert!(parse_blkid(output, Path::new("/dev/sr0")).is_none());
        assert!(parse_blkid("", Path::new("/dev/sr0")).is_none());
    }

    #[test]
    fn test_parse_blkid_without_type_is_none() {
        let output = r#"/dev/sr0: PTUUID="4a5b" PTTYPE="PMBR""#;
        assert!(parse_blkid(output, Path::new("/dev/sr0")).is_none());
    }

    #[test]
    fn test_parse_cdparanoia_toc() {
        let toc = parse_cdparanoia_toc(CDPARANOIA_OUTPUT).unwrap();
        assert_eq!(toc.track_sectors, vec![16503, 17575, 20217]);
        assert_eq!(toc.track_count(), 3);
    }

    #[test]
    fn test_parse_cdparanoia_no_tracks() {
        assert!(parse_cdparanoia_toc("cdparanoia III release 10.2\nUnable to open disc.").is_none());
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = AudioToc { track_sectors: vec![16503, 17575, 20217] };
        let b = AudioToc { track_sectors: vec![16503, 17575, 20217] };
        let c = AudioToc { track_sectors: vec![16503, 17575, 20218] };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 8);
    }

    #[tokio::test]
    async fn test_gather_skips_audio_probe_when_filesystem_wins() {
        let inspector = FakeInspector::new(fs("BACKUP01"), false, toc(4));
        let meta = gather_metadata(&inspector, Path::new("/dev/sr0"), &ClassifyPriority::default()).await;
        assert!(meta.audio_toc.is_none());
        assert_eq!(inspector.audio_probes(), 0);
        assert_eq!(classify(&meta, &ClassifyPriority::default()), DiscType::DataFilesystem);
    }

    #[tokio::test]
    async fn test_gather_probes_audio_without_filesystem() {
        let inspector = FakeInspector::new(None, false, toc(10));
        let meta = gather_metadata(&inspector, Path::new("/dev/sr0"), &ClassifyPriority::default()).await;
        assert_eq!(inspector.audio_probes(), 1);
        assert_eq!(classify(&meta, &ClassifyPriority::default()), DiscType::AudioCd);
    }

    #[tokio::test]
    async fn test_gather_probes_audio_when_ranked_higher() {
        let priority = ClassifyPriority::new(vec![
            DiscType::AudioCd,
            DiscType::DataFilesystem,
            DiscType::DvdVideo,
        ]);
        let inspector = FakeInspector::new(fs("MIXED"), false, toc(8));
        let meta = gather_metadata(&inspector, Path::new("/dev/sr0"), &priority).await;
        assert_eq!(inspector.audio_probes(), 1);
        assert_eq!(classify(&meta, &priority), DiscType::AudioCd);
    }
}
