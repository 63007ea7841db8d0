//! Disc Ripper Daemon
//!
//! Unattended service that watches an optical drive, classifies each inserted
//! disc and rips it to a typed output tree, transcoding DVD titles in parallel.

pub mod classify;
pub mod concurrency;
pub mod daemon;
pub mod dispatcher;
pub mod drive;
pub mod eject;
pub mod inspect;
pub mod job;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod stability;
pub mod startup;
pub mod tools;
pub mod transcode;
pub mod wip;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{classify, ClassifyPriority, DiscInspector, DiscMetadata, DiscType};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError, EXIT_CONFIG, EXIT_OK, EXIT_RUNTIME};
pub use disc_ripper_config as config;
pub use disc_ripper_config::Config;
pub use dispatcher::{Components, CycleOutcome, Dispatcher, JobReport, Phase};
pub use drive::{DriveProbe, DriveState};
pub use eject::{EjectOutcome, Ejector};
pub use job::{Job, JobError, JobStatus, Task, TaskStatus};
pub use metrics::{new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics};
pub use output::{OutputLayout, PromoteError};
pub use process::ToolError;
pub use startup::{run_startup_checks, StartupError, StartupReport};
pub use tools::{SystemToolchain, Toolchain};
pub use wip::{WipDir, WipError, WipStage};
