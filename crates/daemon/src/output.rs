//! Output tree layout and promotion of finished artifacts.
//!
//! The output tree is append-only: promotion never overwrites, and a name
//! that is already taken gets a timestamp suffix.

use crate::classify::DiscType;
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Prefix of the staging directories used by cross-device promotion
pub const INCOMING_PREFIX: &str = ".incoming-";

/// Errors that can occur while promoting an artifact.
#[derive(Debug, Error)]
pub enum PromoteError {
    /// Destination already exists; the output tree is never overwritten.
    #[error("Destination already exists: {0}")]
    Exists(PathBuf),

    /// Failed to move the artifact into place.
    #[error("Failed to move {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to copy the artifact across filesystems.
    #[error("Failed to copy {from} into output tree: {source}")]
    Copy {
        from: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Artifact is not a file or directory: {0}")]
    NotAnArtifact(PathBuf),
}

impl PromoteError {
    /// Underlying IO error, if any
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            PromoteError::Rename { source, .. } | PromoteError::Copy { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The output root and its three fixed subtrees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub iso: PathBuf,
    pub redbook: PathBuf,
    pub dvd: PathBuf,
}

impl OutputLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            iso: root.join("iso"),
            redbook: root.join("redbook"),
            dvd: root.join("dvd"),
        }
    }

    /// Subtree receiving artifacts of a disc type
    pub fn for_type(&self, disc_type: DiscType) -> Option<&Path> {
        match disc_type {
            DiscType::DataFilesystem => Some(&self.iso),
            DiscType::AudioCd => Some(&self.redbook),
            DiscType::DvdVideo => Some(&self.dvd),
            DiscType::Unknown => None,
        }
    }

    pub fn subtrees(&self) -> [&Path; 3] {
        [&self.iso, &self.redbook, &self.dvd]
    }

    /// Create the subtrees; the root itself must already exist
    pub fn ensure(&self) -> io::Result<()> {
        for dir in self.subtrees() {
            if !dir.is_dir() {
                fs::create_dir(dir)?;
                info!(path = %dir.display(), "Created output directory");
            }
        }
        Ok(())
    }

    /// Remove staging directories left by an interrupted cross-device promotion
    pub fn sweep_incoming(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        for dir in self.subtrees() {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(INCOMING_PREFIX) {
                    continue;
                }
                let path = entry.path();
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => {
                        info!(path = %path.display(), "Removed interrupted promotion");
                        removed.push(path);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging entry"),
                }
            }
        }
        removed
    }

    /// Existing artifact for a disc identity, if one was ripped before
    ///
    /// Audio identities are the TOC hash, matched as the `-{hash}` suffix of
    /// an album directory.
    pub fn existing_artifact(&self, disc_type: DiscType, disc_name: &str) -> Option<PathBuf> {
        match disc_type {
            DiscType::DataFilesystem => {
                let path = self.iso.join(format!("{}.iso", disc_name));
                path.exists().then_some(path)
            }
            DiscType::DvdVideo => {
                let path = self.dvd.join(disc_name);
                path.exists().then_some(path)
            }
            DiscType::AudioCd => {
                let suffix = format!("-{}", disc_name);
                fs::read_dir(&self.redbook)
                    .ok()?
                    .filter_map(|e| e.ok())
                    .find(|e| e.file_name().to_string_lossy().ends_with(&suffix))
                    .map(|e| e.path())
            }
            DiscType::Unknown => None,
        }
    }
}

/// Make a disc label safe to use as a single path component
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "disc".to_string()
    } else {
        cleaned
    }
}

fn file_name(stem: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}

/// First free destination for `stem[.ext]` in `dir`
///
/// Collisions get `-{timestamp}`, then `-{timestamp}-{n}`.
pub fn unique_destination(
    dir: &Path,
    stem: &str,
    extension: Option<&str>,
    now: DateTime<Local>,
) -> PathBuf {
    let plain = dir.join(file_name(stem, extension));
    if !plain.exists() {
        return plain;
    }

    let stamped = format!("{}-{}", stem, now.format("%Y%m%d-%H%M%S"));
    let candidate = dir.join(file_name(&stamped, extension));
    if !candidate.exists() {
        return candidate;
    }

    let mut n = 2u32;
    loop {
        let candidate = dir.join(file_name(&format!("{}-{}", stamped, n), extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Move an artifact (file or directory) to `dest`
///
/// Same-filesystem moves are a single rename. Across filesystems the
/// artifact is copied into a hidden `.incoming-*` entry next to `dest`, which
/// is renamed into place once complete, so `dest` never shows a partial copy.
pub fn promote(src: &Path, dest: &Path) -> Result<(), PromoteError> {
    if dest.exists() {
        return Err(PromoteError::Exists(dest.to_path_buf()));
    }

    match fs::rename(src, dest) {
        Ok(()) => {
            debug!(from = %src.display(), to = %dest.display(), "Promoted by rename");
            return Ok(());
        }
        Err(e) if is_cross_device(&e) => {
            debug!(from = %src.display(), to = %dest.display(), "Cross-device promotion");
        }
        Err(source) => {
            return Err(PromoteError::Rename {
                from: src.to_path_buf(),
                to: dest.to_path_buf(),
                source,
            })
        }
    }

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let staging = parent.join(format!("{}{}", INCOMING_PREFIX, Uuid::new_v4().simple()));

    let copied = if src.is_dir() {
        copy_tree(src, &staging)
    } else if src.is_file() {
        fs::copy(src, &staging).map(|_| ())
    } else {
        return Err(PromoteError::NotAnArtifact(src.to_path_buf()));
    };

    if let Err(source) = copied {
        discard(&staging);
        return Err(PromoteError::Copy {
            from: src.to_path_buf(),
            source,
        });
    }

    if let Err(source) = fs::rename(&staging, dest) {
        discard(&staging);
        return Err(PromoteError::Rename {
            from: staging,
            to: dest.to_path_buf(),
            source,
        });
    }

    // the artifact is in place; a leftover source is only WIP garbage
    let removed = if src.is_dir() {
        fs::remove_dir_all(src)
    } else {
        fs::remove_file(src)
    };
    if let Err(e) = removed {
        warn!(path = %src.display(), error = %e, "Failed to remove promoted source");
    }
    Ok(())
}

/// Promote into `dir` under the first free name for `stem[.ext]`
pub fn promote_unique(
    src: &Path,
    dir: &Path,
    stem: &str,
    extension: Option<&str>,
) -> Result<PathBuf, PromoteError> {
    let dest = unique_destination(dir, stem, extension, Local::now());
    promote(src, &dest)?;
    Ok(dest)
}

fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn discard(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to remove staging entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_layout_subtrees() {
        let layout = OutputLayout::new(Path::new("/srv/out"));
        assert_eq!(layout.for_type(DiscType::DataFilesystem), Some(Path::new("/srv/out/iso")));
        assert_eq!(layout.for_type(DiscType::AudioCd), Some(Path::new("/srv/out/redbook")));
        assert_eq!(layout.for_type(DiscType::DvdVideo), Some(Path::new("/srv/out/dvd")));
        assert_eq!(layout.for_type(DiscType::Unknown), None);
    }

    #[test]
    fn test_ensure_creates_subtrees() {
        let root = TempDir::new().unwrap();
        let layout = OutputLayout::new(root.path());
        layout.ensure().unwrap();
        layout.ensure().unwrap();
        for dir in layout.subtrees() {
            assert!(dir.is_dir());
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("BACKUP01"), "BACKUP01");
        assert_eq!(sanitize_name("My Disc/2"), "My_Disc_2");
        assert_eq!(sanitize_name("../etc"), "_etc");
        assert_eq!(sanitize_name("   "), "disc");
    }

    #[test]
    fn test_unique_destination_free_name() {
        let dir = TempDir::new().unwrap();
        let dest = unique_destination(dir.path(), "BACKUP01", Some("iso"), fixed_now());
        assert_eq!(dest, dir.path().join("BACKUP01.iso"));
    }

    #[test]
    fn test_unique_destination_appends_timestamp() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("BACKUP01.iso"), b"old").unwrap();
        let dest = unique_destination(dir.path(), "BACKUP01", Some("iso"), fixed_now());
        assert_eq!(dest, dir.path().join("BACKUP01-20240501-123000.iso"));

        fs::write(&dest, b"older").unwrap();
        let dest = unique_destination(dir.path(), "BACKUP01", Some("iso"), fixed_now());
        assert_eq!(dest, dir.path().join("BACKUP01-20240501-123000-2.iso"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_unique_destination_never_taken(
            stem in "[A-Za-z0-9_]{1,12}",
            taken in 0usize..4,
        ) {
            let dir = TempDir::new().unwrap();
            for _ in 0..taken {
                let path = unique_destination(dir.path(), &stem, Some("iso"), fixed_now());
                fs::write(path, b"x").unwrap();
            }
            let dest = unique_destination(dir.path(), &stem, Some("iso"), fixed_now());
            prop_assert!(!dest.exists());
            prop_assert_eq!(dest.parent(), Some(dir.path()));
        }

        #[test]
        fn prop_sanitized_names_are_single_components(raw in ".{0,40}") {
            let name = sanitize_name(&raw);
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('/'));
            prop_assert!(!name.starts_with('.'));
        }
    }

    #[test]
    fn test_promote_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("BACKUP01.iso");
        fs::write(&src, b"image").unwrap();
        let dest = dir.path().join("out.iso");

        promote(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"image");
    }

    #[test]
    fn test_promote_directory() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("album");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("01.flac"), b"one").unwrap();
        fs::write(src.join("02.flac"), b"two").unwrap();
        let dest = dir.path().join("promoted");

        promote(&src, &dest).unwrap();
        assert!(dest.join("01.flac").exists());
        assert!(dest.join("02.flac").exists());
    }

    #[test]
    fn test_promote_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("new.iso");
        let dest = dir.path().join("old.iso");
        fs::write(&src, b"new").unwrap();
        fs::write(&dest, b"old").unwrap();

        let result = promote(&src, &dest);
        assert!(matches!(result, Err(PromoteError::Exists(_))));
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        assert!(src.exists());
    }

    #[test]
    fn test_copy_tree_preserves_structure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested").join("a.mp4"), b"a").unwrap();
        let dest = dir.path().join("dest");

        copy_tree(&src, &dest).unwrap();
        assert_eq!(fs::read(dest.join("nested").join("a.mp4")).unwrap(), b"a");
    }

    #[test]
    fn test_sweep_incoming() {
        let root = TempDir::new().unwrap();
        let layout = OutputLayout::new(root.path());
        layout.ensure().unwrap();
        let stale = layout.dvd.join(".incoming-1234");
        fs::create_dir(&stale).unwrap();
        let kept = layout.dvd.join("MOVIE-abc");
        fs::create_dir(&kept).unwrap();

        let removed = layout.sweep_incoming();
        assert_eq!(removed, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(kept.exists());
    }

    #[test]
    fn test_existing_artifact() {
        let root = TempDir::new().unwrap();
        let layout = OutputLayout::new(root.path());
        layout.ensure().unwrap();
        fs::write(layout.iso.join("BACKUP01.iso"), b"x").unwrap();
        fs::create_dir(layout.redbook.join("Some Album-1a2b3c4d")).unwrap();

        assert!(layout
            .existing_artifact(DiscType::DataFilesystem, "BACKUP01")
            .is_some());
        assert!(layout
            .existing_artifact(DiscType::DataFilesystem, "OTHER")
            .is_none());
        assert!(layout
            .existing_artifact(DiscType::AudioCd, "1a2b3c4d")
            .is_some());
        assert!(layout.existing_artifact(DiscType::DvdVideo, "MOVIE").is_none());
    }
}
