//! Stability checking for extracted title files.
//!
//! Before transcoding, every extracted title must be finalized on disk: its
//! size has to stay unchanged over a configurable window.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

/// Result of a stability check on a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// File size remained unchanged during the stability window.
    Stable,
    /// File size changed during the stability window.
    Unstable {
        /// Size when first checked.
        initial_size: u64,
        /// Size after waiting.
        current_size: u64,
    },
}

/// Compare two file sizes and return the appropriate StabilityResult.
#[inline]
pub fn compare_sizes(initial_size: u64, current_size: u64) -> StabilityResult {
    if initial_size == current_size {
        StabilityResult::Stable
    } else {
        StabilityResult::Unstable {
            initial_size,
            current_size,
        }
    }
}

/// A file that failed the stability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstableFile {
    pub path: PathBuf,
    pub result: StabilityResult,
}

/// Check a set of files in one shared window
///
/// Sizes are taken, the window elapses once, then sizes are taken again.
/// Empty files are reported as unstable with both sizes zero.
pub async fn check_files_stable(
    paths: &[PathBuf],
    wait: Duration,
) -> Result<Vec<UnstableFile>, std::io::Error> {
    let mut initial = Vec::with_capacity(paths.len());
    for path in paths {
        initial.push(file_size(path).await?);
    }

    if !wait.is_zero() {
        sleep(wait).await;
    }

    let mut unstable = Vec::new();
    for (path, initial_size) in paths.iter().zip(initial) {
        let current_size = file_size(path).await?;
        let result = compare_sizes(initial_size, current_size);
        if result != StabilityResult::Stable || current_size == 0 {
            unstable.push(UnstableFile {
                path: path.clone(),
                result: StabilityResult::Unstable {
                    initial_size,
                    current_size,
                },
            });
        }
    }
    Ok(unstable)
}

async fn file_size(path: &Path) -> Result<u64, std::io::Error> {
    Ok(tokio::fs::metadata(path).await?.len())
}
