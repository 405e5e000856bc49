//! Multi-file fan-out
//!
//! One run walks `INIT -> LIFECYCLE_PRE -> DISPATCH -> DRAIN -> LIFECYCLE_POST`
//! and ends in `DONE` or `FAILED`. Every per-path clone feeds the same worker
//! pool and the same completion channel; the drain waits for exactly as many
//! results as tasks were dispatched, failures included.

use std::fmt;
use std::sync::Arc;

use fanload_common::{FanloadError, LoadFailure, Result, TaskKind};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::LoadOptions;
use crate::job::LoadJob;
use crate::lifecycle::TableLifecycleCoordinator;
use crate::pipeline::{build_unit, LoadUnit, RowChannel, TaskLayout, TaskResult};
use crate::pool::WorkerPool;
use crate::source::expand_source;
use crate::stats::{LoadStats, StatsReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Init,
    LifecyclePre,
    Dispatch,
    Drain,
    LifecyclePost,
    Done,
    Failed,
}

impl LoadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPhase::Init => "init",
            LoadPhase::LifecyclePre => "lifecycle_pre",
            LoadPhase::Dispatch => "dispatch",
            LoadPhase::Drain => "drain",
            LoadPhase::LifecyclePost => "lifecycle_post",
            LoadPhase::Done => "done",
            LoadPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadPhase::Done | LoadPhase::Failed)
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct PhaseTracker {
    current: LoadPhase,
}

impl PhaseTracker {
    fn start() -> Self {
        debug!(phase = %LoadPhase::Init, "Load phase");
        Self {
            current: LoadPhase::Init,
        }
    }

    fn advance(&mut self, next: LoadPhase) {
        debug!(from = %self.current, phase = %next, "Load phase");
        self.current = next;
    }
}

pub struct FanoutOrchestrator {
    options: LoadOptions,
    layout: TaskLayout,
    reporter: Arc<dyn StatsReporter>,
}

impl FanoutOrchestrator {
    pub fn new(options: LoadOptions) -> Self {
        Self {
            options,
            layout: TaskLayout::default(),
            reporter: Arc::new(LoadStats::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Tasks each physical path contributes with the current options
    pub fn tasks_per_path(&self) -> usize {
        self.layout.tasks_per_path(self.options.concurrency)
    }

    /// Load every path of `job`'s source into its target table.
    ///
    /// Returns the number of dispatched tasks, or a `LoadFailed` error listing
    /// every failed task and lifecycle step once all tasks have reported.
    pub async fn run(&self, job: &LoadJob) -> Result<usize> {
        self.options.validate()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("load", run_id = %run_id, table = %job.table());
        self.run_phases(job).instrument(span).await
    }

    async fn run_phases(&self, job: &LoadJob) -> Result<usize> {
        let mut phase = PhaseTracker::start();
        let pool = WorkerPool::new(self.options.worker_count)?;
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let coordinator = TableLifecycleCoordinator::new(job, &self.options);
        let mut failure = LoadFailure::default();

        phase.advance(LoadPhase::LifecyclePre);
        let prepared = match coordinator.pre().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Table preparation failed, nothing will be loaded");
                failure.lifecycle_failures.push(e);
                false
            }
        };

        let mut expected = 0;
        if prepared {
            phase.advance(LoadPhase::Dispatch);
            match self.dispatch(job, &pool, &results_tx).await {
                Ok(dispatched) => expected = dispatched,
                Err(e) => {
                    error!(error = %e, "Source expansion failed");
                    failure.dispatch_failures.push(e);
                }
            }
        }
        // Only tasks hold senders from here on
        drop(results_tx);

        phase.advance(LoadPhase::Drain);
        self.drain(expected, &mut results_rx, &pool, &mut failure).await;

        phase.advance(LoadPhase::LifecyclePost);
        if let Err(e) = coordinator.post().await {
            error!(error = %e, "Index recreation failed");
            failure.lifecycle_failures.push(e);
        }
        pool.await_shutdown().await;

        failure.dispatched = expected;
        if failure.is_empty() {
            phase.advance(LoadPhase::Done);
            info!(tasks = expected, "Load complete");
            Ok(expected)
        } else {
            phase.advance(LoadPhase::Failed);
            error!(
                tasks = expected,
                failed_tasks = failure.task_failures.len(),
                lifecycle_errors = failure.lifecycle_failures.len(),
                "Load failed"
            );
            Err(FanloadError::LoadFailed(Box::new(failure)))
        }
    }

    /// Expand the source, clone the job per path and queue every unit.
    /// Returns the number of tasks that will report.
    async fn dispatch(
        &self,
        job: &LoadJob,
        pool: &WorkerPool,
        results: &mpsc::UnboundedSender<TaskResult>,
    ) -> Result<usize> {
        let spec = job.source().spec().clone();
        let paths = tokio::task::spawn_blocking(move || expand_source(&spec))
            .await
            .map_err(|e| FanloadError::Io(std::io::Error::other(e)))??;

        let units = self.options.concurrency;
        let channel = RowChannel::for_workers(pool.size());
        info!(
            paths = paths.len(),
            units_per_path = units,
            tasks_per_path = self.tasks_per_path(),
            workers = pool.size(),
            channel = ?channel,
            "Dispatching load"
        );

        for path in &paths {
            let clone = Arc::new(job.clone_for(path));
            for index in 0..units {
                let unit = LoadUnit::new(index, units);
                let tasks = build_unit(
                    Arc::clone(&clone),
                    unit,
                    self.options.batch_rows,
                    channel,
                    results.clone(),
                );
                // Readers go first so a queued writer never waits on a reader behind it
                submit(pool, &clone, unit, TaskKind::Reader, tasks.reader, results);
                submit(pool, &clone, unit, TaskKind::Writer, tasks.writer, results);
            }
        }

        Ok(paths.len() * self.tasks_per_path())
    }

    async fn drain(
        &self,
        expected: usize,
        results: &mut mpsc::UnboundedReceiver<TaskResult>,
        pool: &WorkerPool,
        failure: &mut LoadFailure,
    ) {
        if expected == 0 {
            pool.request_shutdown();
            return;
        }

        let mut received = 0;
        while received < expected {
            let Some(result) = results.recv().await else {
                failure.dispatch_failures.push(FanloadError::target(format!(
                    "completion channel closed after {} of {} results",
                    received, expected
                )));
                break;
            };
            received += 1;
            if received == 1 {
                pool.request_shutdown();
            }

            match result.kind {
                TaskKind::Writer => {
                    self.reporter
                        .report(result.kind, &result.table, result.seconds, result.rows);
                }
                TaskKind::Reader => {
                    debug!(path = %result.path.display(), rows = result.rows, seconds = result.seconds, "Reader reported");
                }
            }

            match result.to_failure() {
                Some(task_failure) => failure.task_failures.push(task_failure),
                None => info!(
                    kind = %result.kind,
                    path = %result.path.display(),
                    unit = result.unit,
                    rows = result.rows,
                    seconds = format_args!("{:.3}", result.seconds),
                    received,
                    expected,
                    "Task finished"
                ),
            }
        }
    }
}

fn submit(
    pool: &WorkerPool,
    job: &LoadJob,
    unit: LoadUnit,
    kind: TaskKind,
    task: BoxFuture<'static, ()>,
    results: &mpsc::UnboundedSender<TaskResult>,
) {
    if let Err(e) = pool.submit(task) {
        warn!(kind = %kind, unit = unit.index, error = %e, "Task rejected by worker pool");
        let _ = results.send(TaskResult::failed(kind, job, unit.index, e));
    }
}

/// Run one load with a fresh orchestrator
pub async fn run_load(job: &LoadJob, options: &LoadOptions) -> Result<usize> {
    FanoutOrchestrator::new(options.clone()).run(job).await
}
