//! Concurrency planning for the transcode fan-out
//!
//! Derives the transcode slot count from CPU core count and configuration.

use crate::config::Config;

/// Cores assumed to be kept busy by one ffmpeg x264 encode
const CORES_PER_TRANSCODE: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of transcode Tasks running at once
    pub max_concurrent_transcodes: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// An explicit non-zero `transcode.max_concurrent` is used unchanged;
    /// otherwise one slot per four cores, at least one.
    pub fn derive(cfg: &Config) -> Self {
        Self::for_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count
    pub fn for_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_transcodes = if cfg.transcode.max_concurrent > 0 {
            cfg.transcode.max_concurrent
        } else {
            derive_max_transcodes(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_transcodes,
        }
    }
}

/// Default slot count for a core count
fn derive_max_transcodes(cores: u32) -> u32 {
    (cores / CORES_PER_TRANSCODE).max(1)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
