//! Pipeline dispatcher.
//!
//! An explicit state machine driven by [`Dispatcher::tick`]:
//!
//! ```text
//! Idle -> Classifying -> Ripping -> [Transcoding] -> Promoting -> Ejecting -> Idle
//! ```
//!
//! Every path out of a cycle, success or failure, goes through `Ejecting`,
//! which is the only place the drive is released. The dispatcher owns the
//! active Job, so at most one Job exists at a time.

use crate::classify::{classify, gather_metadata, ClassifyPriority, DiscInspector, DiscType};
use crate::concurrency::derive_plan;
use crate::config::{Config, ConfigError};
use crate::drive::{CdromIoctlProbe, DriveMonitor, DriveProbe, PollOutcome};
use crate::eject::{EjectController, EjectOutcome, Ejector, SystemEjector};
use crate::inspect::SystemInspector;
use crate::job::{Job, JobError, JobStatus, TaskStatus};
use crate::metrics::{available_space, now_unix_ms, write_status_file, JobMetrics, SharedMetrics};
use crate::output::OutputLayout;
use crate::pipeline::{self, check_free_space, disc_identity, dvd, PipelineContext, RipOutcome, StagedArtifact};
use crate::tools::{SystemToolchain, Toolchain};
use crate::wip::{WipDir, WipStage};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mount point for disc inspection, hidden inside the WIP root
pub const INSPECT_MOUNT_DIR: &str = ".mnt";

/// The hardware and tool seams the dispatcher drives
#[derive(Clone)]
pub struct Components {
    pub probe: Arc<dyn DriveProbe>,
    pub inspector: Arc<dyn DiscInspector>,
    pub toolchain: Arc<dyn Toolchain>,
    pub ejector: Arc<dyn Ejector>,
}

impl Components {
    /// Real drive, system tools
    pub fn system(cfg: &Config) -> Self {
        let grace = Duration::from_secs(cfg.process.termination_grace_secs);
        let use_sudo = cfg.process.use_sudo_fallback;
        Self {
            probe: Arc::new(CdromIoctlProbe),
            inspector: Arc::new(SystemInspector::new(
                cfg.paths.wip_root.join(INSPECT_MOUNT_DIR),
                use_sudo,
                grace,
            )),
            toolchain: Arc::new(SystemToolchain::from_config(cfg)),
            ejector: Arc::new(SystemEjector::new(use_sudo, grace)),
        }
    }
}

/// Final record of a Job, kept after its WIP directory is gone
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
    pub id: String,
    pub disc_type: DiscType,
    pub disc_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub titles: usize,
    pub failed_titles: Vec<usize>,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
    pub cancelled: bool,
    /// False for Jobs recovered from a previous run (no disc to eject)
    pub owns_drive: bool,
    /// WIP directory that could not be removed; swept on next startup
    pub leftover_wip: Option<PathBuf>,
}

/// How an insertion cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A Job ran to a terminal status
    Finished(JobReport),
    /// The disc was released without a Job
    Skipped { disc: String, reason: String },
    /// The disc never became readable
    Abandoned { reason: String },
}

impl CycleOutcome {
    /// Whether the cycle ends by releasing the drive, and whether forcibly
    fn eject_mode(&self) -> Option<bool> {
        match self {
            CycleOutcome::Finished(report) if !report.owns_drive => None,
            CycleOutcome::Finished(_) | CycleOutcome::Skipped { .. } => Some(false),
            CycleOutcome::Abandoned { .. } => Some(true),
        }
    }
}

/// Dispatcher states; Job-carrying states own the active Job
#[derive(Debug)]
pub enum Phase {
    Idle,
    Classifying,
    Ripping(Job),
    Transcoding(Job),
    Promoting(Job, StagedArtifact),
    Ejecting(CycleOutcome),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Classifying => "classifying",
            Phase::Ripping(_) => "ripping",
            Phase::Transcoding(_) => "transcoding",
            Phase::Promoting(..) => "promoting",
            Phase::Ejecting(_) => "ejecting",
        }
    }
}

/// Behaviour switches taken from the output configuration
#[derive(Debug, Clone)]
struct DispatchOptions {
    skip_already_ripped: bool,
    min_free_bytes: u64,
    status_file: Option<PathBuf>,
}

pub struct Dispatcher {
    monitor: DriveMonitor,
    inspector: Arc<dyn DiscInspector>,
    priority: ClassifyPriority,
    ctx: PipelineContext,
    layout: OutputLayout,
    wip_root: PathBuf,
    eject: EjectController,
    options: DispatchOptions,
    metrics: SharedMetrics,
    cancel: CancellationToken,
    phase: Phase,
    /// The last disc handled is still in the drive; do not rip it again
    awaiting_removal: bool,
    recovered: VecDeque<Job>,
    cycles: u64,
    last_outcome: Option<CycleOutcome>,
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        components: Components,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let priority = ClassifyPriority::from_config(&cfg.classify)?;
        let plan = derive_plan(cfg);
        let device = cfg.drive.device.clone();

        let monitor = DriveMonitor::new(
            device.clone(),
            components.probe.clone(),
            Duration::from_secs(cfg.drive.poll_interval_secs),
            Duration::from_secs(cfg.drive.retry_backoff_max_secs),
            cfg.drive.max_consecutive_failures,
        );
        let ctx = PipelineContext {
            device: device.clone(),
            toolchain: components.toolchain,
            probe: components.probe,
            max_transcodes: plan.max_concurrent_transcodes as usize,
            stability_wait: Duration::from_secs(cfg.transcode.stability_wait_secs),
            output_extension: cfg.transcode.output_extension.clone(),
        };
        info!(
            device = %device.display(),
            max_transcodes = ctx.max_transcodes,
            priority = ?priority.order(),
            "Dispatcher configured"
        );

        Ok(Self {
            monitor,
            inspector: components.inspector,
            priority,
            ctx,
            layout: OutputLayout::new(&cfg.paths.out_root),
            wip_root: cfg.paths.wip_root.clone(),
            eject: EjectController::new(components.ejector, device, cfg.drive.eject_on_completion),
            options: DispatchOptions {
                skip_already_ripped: cfg.output.skip_already_ripped,
                min_free_bytes: cfg.output.min_free_bytes,
                status_file: cfg.output.status_file.clone(),
            },
            metrics,
            cancel,
            phase: Phase::Idle,
            awaiting_removal: false,
            recovered: VecDeque::new(),
            cycles: 0,
            last_outcome: None,
        })
    }

    /// Queue WIP directories found by the startup sweep for resumption
    pub fn resume(&mut self, wips: Vec<WipDir>) {
        for wip in wips {
            let output_dir = self.layout.dvd.clone();
            let job = Job::from_wip(wip, &output_dir, false);
            info!(job_id = %job.id, disc = %job.disc_name, "Queued interrupted job for resumption");
            self.recovered.push_back(job);
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    /// Completed insertion cycles (including recovered Jobs)
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn last_outcome(&self) -> Option<&CycleOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn eject_invocations(&self) -> u64 {
        self.eject.invocations()
    }

    /// Perform one transition and return how long to wait before the next
    pub async fn tick(&mut self) -> Duration {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let from = phase.name();
        let (next, delay) = match phase {
            Phase::Idle => self.on_idle().await,
            Phase::Classifying => (self.on_classifying().await, Duration::ZERO),
            Phase::Ripping(job) => (self.on_ripping(job).await, Duration::ZERO),
            Phase::Transcoding(job) => (self.on_transcoding(job).await, Duration::ZERO),
            Phase::Promoting(job, artifact) => (self.on_promoting(job, artifact), Duration::ZERO),
            Phase::Ejecting(outcome) => {
                self.on_ejecting(outcome).await;
                (Phase::Idle, self.monitor.next_delay())
            }
        };

        if from != next.name() {
            debug!(from, to = next.name(), "Dispatcher transition");
        }
        self.phase = next;
        self.metrics.write().await.phase = self.phase.name().to_string();
        delay
    }

    /// Drive the state machine until the current cycle ends
    ///
    /// Delays between polls are skipped; intended for callers that already
    /// know a disc is waiting.
    pub async fn run_cycle(&mut self) -> Option<CycleOutcome> {
        let start = self.cycles;
        while self.cycles == start {
            self.tick().await;
            if self.cancel.is_cancelled() && self.is_idle() {
                break;
            }
        }
        self.last_outcome.clone()
    }

    async fn on_idle(&mut self) -> (Phase, Duration) {
        if self.cancel.is_cancelled() {
            return (Phase::Idle, Duration::ZERO);
        }

        if let Some(job) = self.recovered.pop_front() {
            self.metrics.write().await.jobs_started += 1;
            return (Phase::Transcoding(job), Duration::ZERO);
        }

        match self.monitor.poll().await {
            PollOutcome::NoDisc(state) => {
                if self.awaiting_removal {
                    debug!(%state, "Previous disc removed");
                }
                self.awaiting_removal = false;
                (Phase::Idle, self.monitor.next_delay())
            }
            PollOutcome::NotReady { attempt } => {
                debug!(attempt, "Disc not ready yet");
                (Phase::Idle, self.monitor.next_delay())
            }
            PollOutcome::Ready if self.awaiting_removal => (Phase::Idle, self.monitor.next_delay()),
            PollOutcome::Ready => {
                info!(device = %self.monitor.device().display(), "Disc ready");
                (Phase::Classifying, Duration::ZERO)
            }
            PollOutcome::GaveUp { .. } if self.awaiting_removal => {
                (Phase::Idle, self.monitor.next_delay())
            }
            PollOutcome::GaveUp { attempts } => {
                let reason = format!("disc unreadable after {} attempts", attempts);
                (Phase::Ejecting(CycleOutcome::Abandoned { reason }), Duration::ZERO)
            }
        }
    }

    async fn on_classifying(&mut self) -> Phase {
        if self.cancel.is_cancelled() {
            return Phase::Idle;
        }

        let device = self.monitor.device().to_path_buf();
        let meta = gather_metadata(self.inspector.as_ref(), &device, &self.priority).await;
        let disc_type = classify(&meta, &self.priority);

        let Some(output_dir) = self.layout.for_type(disc_type).map(|p| p.to_path_buf()) else {
            let disc = meta
                .filesystem
                .as_ref()
                .and_then(|fs| fs.label.clone())
                .unwrap_or_else(|| device.display().to_string());
            return Phase::Ejecting(CycleOutcome::Skipped {
                disc,
                reason: "no known disc layout detected".to_string(),
            });
        };

        let disc_name = disc_identity(disc_type, &meta);
        info!(disc = %disc_name, %disc_type, "Disc classified");

        if self.options.skip_already_ripped {
            if let Some(existing) = self.layout.existing_artifact(disc_type, &disc_name) {
                return Phase::Ejecting(CycleOutcome::Skipped {
                    disc: disc_name,
                    reason: format!("already ripped to {}", existing.display()),
                });
            }
        }

        if let Err(e) = check_free_space(&self.wip_root, self.options.min_free_bytes) {
            return Phase::Ejecting(CycleOutcome::Skipped {
                disc: disc_name,
                reason: e.to_string(),
            });
        }

        match Job::start(&self.wip_root, disc_type, &disc_name, &output_dir) {
            Ok(job) => {
                info!(job_id = %job.id, disc = %disc_name, wip = %job.wip.path().display(), "Job started");
                self.metrics.write().await.jobs_started += 1;
                Phase::Ripping(job)
            }
            Err(e) => Phase::Ejecting(CycleOutcome::Skipped {
                disc: disc_name,
                reason: format!("could not start job: {}", e),
            }),
        }
    }

    async fn on_ripping(&mut self, mut job: Job) -> Phase {
        if self.cancel.is_cancelled() {
            return self.finish(job, Err(JobError::Cancelled));
        }
        match pipeline::rip(&self.ctx, &mut job, &self.cancel).await {
            Ok(RipOutcome::Staged(artifact)) => Phase::Promoting(job, artifact),
            Ok(RipOutcome::NeedsTranscode) => Phase::Transcoding(job),
            Err(e) => self.finish(job, Err(e)),
        }
    }

    async fn on_transcoding(&mut self, mut job: Job) -> Phase {
        if self.cancel.is_cancelled() {
            return self.finish(job, Err(JobError::Cancelled));
        }
        match dvd::transcode(&self.ctx, &mut job, &self.cancel).await {
            Ok(artifact) => Phase::Promoting(job, artifact),
            Err(e) => self.finish(job, Err(e)),
        }
    }

    fn on_promoting(&mut self, job: Job, artifact: StagedArtifact) -> Phase {
        let result = pipeline::promote(&job, &artifact);
        self.finish(job, result)
    }

    /// Close a Job: record its status and clean its WIP directory
    fn finish(&mut self, mut job: Job, result: Result<PathBuf, JobError>) -> Phase {
        let finished_at = Utc::now();
        let (output, error, cancelled) = match result {
            Ok(dest) => {
                job.status = JobStatus::Succeeded;
                (Some(dest), None, false)
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                if let Err(mark) = job.wip.set_stage(WipStage::Failed) {
                    debug!(error = %mark, "Could not mark WIP directory failed");
                }
                let cancelled = e.is_cancelled();
                (None, Some(e.to_string()), cancelled)
            }
        };

        let report_base = JobReport {
            id: job.id.to_string(),
            disc_type: job.disc_type,
            disc_name: job.disc_name.clone(),
            status: job.status,
            started_at: job.started_at,
            finished_at,
            titles: job.tasks.len(),
            failed_titles: job
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.title)
                .collect(),
            output,
            error,
            cancelled,
            owns_drive: job.owns_drive,
            leftover_wip: None,
        };

        let wip_path = job.wip.path().to_path_buf();
        let leftover_wip = match job.wip.remove() {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    path = %wip_path.display(),
                    error = %e,
                    "Failed to clean WIP directory; it will be swept on next startup"
                );
                Some(wip_path)
            }
        };

        Phase::Ejecting(CycleOutcome::Finished(JobReport {
            leftover_wip,
            ..report_base
        }))
    }

    async fn on_ejecting(&mut self, outcome: CycleOutcome) {
        log_outcome(&outcome);

        let eject = match outcome.eject_mode() {
            Some(force) => Some(self.eject.eject(force).await),
            None => None,
        };
        if !matches!(&outcome, CycleOutcome::Finished(r) if !r.owns_drive) {
            self.awaiting_removal = true;
        }
        self.monitor.reset();
        self.record(&outcome, eject.as_ref()).await;

        self.cycles += 1;
        self.last_outcome = Some(outcome);
    }

    async fn record(&self, outcome: &CycleOutcome, eject: Option<&EjectOutcome>) {
        let snapshot = {
            let mut m = self.metrics.write().await;
            m.timestamp_unix_ms = now_unix_ms();
            match eject {
                Some(EjectOutcome::Ejected) => m.ejects += 1,
                Some(EjectOutcome::Failed(_)) => m.eject_failures += 1,
                Some(EjectOutcome::Skipped) | None => {}
            }
            match outcome {
                CycleOutcome::Finished(report) => {
                    match report.status {
                        JobStatus::Succeeded => m.jobs_succeeded += 1,
                        _ => m.jobs_failed += 1,
                    }
                    m.last_job = Some(job_metrics(report));
                }
                CycleOutcome::Skipped { disc, reason } => {
                    m.discs_skipped += 1;
                    m.last_skip = Some(format!("{}: {}", disc, reason));
                }
                CycleOutcome::Abandoned { reason } => {
                    m.discs_skipped += 1;
                    m.last_skip = Some(reason.clone());
                }
            }
            m.wip_free_bytes = available_space(&self.wip_root);
            m.clone()
        };

        if let Some(path) = &self.options.status_file {
            if let Err(e) = write_status_file(path, &snapshot).await {
                warn!(path = %path.display(), error = %e, "Failed to write status file");
            }
        }
    }
}

fn job_metrics(report: &JobReport) -> JobMetrics {
    JobMetrics {
        id: report.id.clone(),
        disc_type: report.disc_type.to_string(),
        disc_name: report.disc_name.clone(),
        status: report.status.to_string(),
        started_at_unix_ms: report.started_at.timestamp_millis(),
        finished_at_unix_ms: report.finished_at.timestamp_millis(),
        titles: report.titles,
        failed_titles: report.failed_titles.clone(),
        output: report.output.as_ref().map(|p| p.display().to_string()),
        error: report.error.clone(),
    }
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Finished(report) => match (&report.status, &report.error) {
            (JobStatus::Succeeded, _) => info!(
                job_id = %report.id,
                disc = %report.disc_name,
                disc_type = %report.disc_type,
                output = ?report.output,
                "Job succeeded"
            ),
            (_, error) if report.cancelled => warn!(
                job_id = %report.id,
                disc = %report.disc_name,
                error = ?error,
                "Job cancelled"
            ),
            (_, error) => error!(
                job_id = %report.id,
                disc = %report.disc_name,
                disc_type = %report.disc_type,
                error = error.as_deref().unwrap_or("unknown"),
                "Job failed"
            ),
        },
        CycleOutcome::Skipped { disc, reason } => {
            warn!(disc = %disc, reason = %reason, "Disc skipped")
        }
        CycleOutcome::Abandoned { reason } => {
            warn!(reason = %reason, "Disc abandoned, ejecting")
        }
    }
}
