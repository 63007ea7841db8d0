//! Status snapshot for the ripper
//!
//! Counters and the last outcome, kept in shared state and optionally
//! written as JSON after every cycle.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Summary of the most recent Job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub disc_type: String,
    pub disc_name: String,
    pub status: String,
    pub started_at_unix_ms: i64,
    pub finished_at_unix_ms: i64,
    pub titles: usize,
    pub failed_titles: Vec<usize>,
    /// Promoted artifact, for successful Jobs
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Complete status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    /// Dispatcher phase name
    pub phase: String,
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub discs_skipped: u64,
    pub ejects: u64,
    pub eject_failures: u64,
    pub wip_free_bytes: Option<u64>,
    pub last_job: Option<JobMetrics>,
    /// Last cycle that ended without a Job (skip or abandon)
    pub last_skip: Option<String>,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Current time in milliseconds since the Unix epoch
pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Free space on the filesystem holding `path`, via sysinfo
///
/// Picks the disk with the longest mount point that prefixes `path`.
pub fn available_space(path: &Path) -> Option<u64> {
    use sysinfo::Disks;

    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Write the snapshot as pretty JSON, replacing the file atomically
pub async fn write_status_file(path: &Path, snapshot: &MetricsSnapshot) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
