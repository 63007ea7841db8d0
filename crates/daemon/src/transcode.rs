//! Transcode fan-out for DVD titles.
//!
//! Runs one transcode per Task with a semaphore bounding how many run at
//! once. A failing Task never aborts its siblings; the caller decides what a
//! failure means for the Job once every Task is terminal.

use crate::job::{Task, TaskStatus};
use crate::tools::Toolchain;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded executor for transcode Tasks
pub struct TranscodeFanout {
    toolchain: Arc<dyn Toolchain>,
    semaphore: Arc<Semaphore>,
    limit: usize,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TranscodeFanout {
    pub fn new(toolchain: Arc<dyn Toolchain>, max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            toolchain,
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Highest number of Tasks observed running at the same instant
    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Run every Task to a terminal state and return them ordered by title
    pub async fn run(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> Vec<Task> {
        let total = tasks.len();
        let mut pending: BTreeMap<usize, Task> = BTreeMap::new();
        let mut set = JoinSet::new();

        for task in tasks {
            pending.insert(task.title, task.clone());
            let toolchain = Arc::clone(&self.toolchain);
            let semaphore = Arc::clone(&self.semaphore);
            let running = Arc::clone(&self.running);
            let peak = Arc::clone(&self.peak);
            let cancel = cancel.clone();

            set.spawn(async move {
                run_task(task, toolchain, semaphore, running, peak, cancel).await
            });
        }

        let mut done: Vec<Task> = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(task) => {
                    pending.remove(&task.title);
                    done.push(task);
                }
                Err(e) => warn!(error = %e, "Transcode task aborted"),
            }
        }

        // anything never reported back died with its worker
        for (_, mut task) in pending {
            task.status = TaskStatus::Failed;
            task.error = Some("transcode worker aborted".to_string());
            done.push(task);
        }

        done.sort_by_key(|t| t.title);
        let failed = done.iter().filter(|t| t.status == TaskStatus::Failed).count();
        info!(total, failed, peak = self.peak_running(), "Transcode fan-out finished");
        done
    }
}

async fn run_task(
    mut task: Task,
    toolchain: Arc<dyn Toolchain>,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> Task {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            task.status = TaskStatus::Failed;
            task.error = Some("cancelled before start".to_string());
            return task;
        }
        permit = semaphore.acquire_owned() => permit,
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(e) => {
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
            return task;
        }
    };

    let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
    peak.fetch_max(now_running, Ordering::SeqCst);
    task.status = TaskStatus::Running;
    debug!(title = task.title, source = %task.source.display(), "Transcode started");

    let result = toolchain
        .transcode(&task.source, &task.target, &cancel)
        .await;
    running.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(()) => {
            task.status = TaskStatus::Succeeded;
            info!(title = task.title, target = %task.target.display(), "Title transcoded");
        }
        Err(e) => {
            warn!(title = task.title, error = %e, "Title transcode failed");
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
        }
    }
    task
}
