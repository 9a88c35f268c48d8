//! Polling dispatcher: turns queued jobs and pending runs into driven runs.
//!
//! One pass (`dispatch_once`) does the following:
//!
//! 1. Claim pending runs whose `not_before` has passed. The store rejects a
//!    claim when another run with the same idempotency key is running or
//!    succeeded; a pending run behind a succeeded one is retired.
//! 2. Fill the remaining capacity by creating and claiming the first run of
//!    queued jobs.
//! 3. Drive claimed runs concurrently (up to `worker_concurrency`) and
//!    record the outcome on the run and its job. A failed run gets a
//!    successor with the next attempt and the predecessor's checkpoint, or
//!    fails the job once attempts are exhausted. A run reaped while being
//!    driven has lost its lease and its outcome is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mediarun_batch::{BatchSummary, WorkScope};
use mediarun_core::{Cursor, JobId, RunId};

use super::driver::{ProgressSink, RunContext, RunError, RunHandler};
use super::run::{JobRun, RunMetrics, truncate_excerpt};
use super::run_store::RunStore;
use super::store::JobStore;
use super::types::{JobLogLevel, JobType, NewJobLog, RetryPolicy};
use crate::checkpoint::CheckpointStore;
use crate::config::DispatchSettings;
use crate::error::StoreError;

/// Handlers by job type.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    handlers: HashMap<JobType, Arc<dyn RunHandler>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own job type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn RunHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn RunHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn RunHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    pub poll_interval: Duration,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub stale_after: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_settings(&DispatchSettings::default())
    }
}

impl DispatcherConfig {
    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self {
            name: "dispatcher".to_string(),
            poll_interval: settings.poll_interval,
            worker_concurrency: settings.worker_concurrency.max(1),
            max_attempts: settings.max_attempts.max(1),
            stale_after: settings.stale_after,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Counters for one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub claimed: usize,
    pub conflicts: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Runs whose outcome was dropped because they had been reaped.
    pub lost: usize,
    /// Pending runs retired because their key had already succeeded.
    pub superseded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Succeeded,
    Retried,
    Failed,
    /// The run was reaped while this dispatcher drove it.
    LeaseLost,
}

pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: WorkerRegistry,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: WorkerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            jobs,
            runs,
            checkpoints,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// One claim-and-drive pass. Returns after every claimed run finished.
    pub async fn dispatch_once(&self) -> Result<DispatchStats, StoreError> {
        let mut stats = DispatchStats::default();
        let capacity = self.config.worker_concurrency;
        let mut seen = HashSet::new();

        let pending = self.runs.next_pending(Utc::now(), capacity).await?;
        let mut claimed = self.claim_all(pending, &mut seen, &mut stats).await?;

        // queued jobs fill whatever the pending runs did not claim, so runs
        // that keep losing their claim cannot starve new work
        if claimed.len() < capacity {
            let queued = self.jobs.next_queued(capacity - claimed.len()).await?;
            let mut fresh = Vec::with_capacity(queued.len());
            for job in queued {
                let first = match JobRun::first(&job, self.config.max_attempts) {
                    Ok(run) => run,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "cannot create run for job");
                        continue;
                    }
                };
                let run = self.runs.create(&first).await?.into_run();
                if run.is_ready(Utc::now()) {
                    fresh.push(run);
                }
            }
            claimed.extend(self.claim_all(fresh, &mut seen, &mut stats).await?);
        }
        stats.claimed = claimed.len();

        let outcomes = join_all(claimed.into_iter().map(|run| self.execute_run(run))).await;
        for outcome in outcomes {
            match outcome {
                Ok(RunOutcome::Succeeded) => stats.succeeded += 1,
                Ok(RunOutcome::Retried) => stats.retried += 1,
                Ok(RunOutcome::Failed) => stats.failed += 1,
                Ok(RunOutcome::LeaseLost) => stats.lost += 1,
                Err(e) => {
                    error!(dispatcher = %self.config.name, error = %e, "failed to record run outcome");
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn claim_all(
        &self,
        candidates: Vec<JobRun>,
        seen: &mut HashSet<RunId>,
        stats: &mut DispatchStats,
    ) -> Result<Vec<JobRun>, StoreError> {
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !seen.insert(candidate.run_id) {
                continue;
            }
            match self.runs.claim(candidate.run_id).await {
                Ok(run) => {
                    info!(
                        dispatcher = %self.config.name,
                        run_id = %run.run_id,
                        job_id = %run.job_id,
                        idempotency_key = %run.idempotency_key,
                        attempt = run.attempt,
                        "claimed run"
                    );
                    claimed.push(run);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(run_id = %candidate.run_id, reason = %reason, "claim lost");
                    stats.conflicts += 1;
                    if self.runs.supersede(candidate.run_id).await? {
                        info!(
                            run_id = %candidate.run_id,
                            idempotency_key = %candidate.idempotency_key,
                            "retired pending run behind a succeeded run"
                        );
                        stats.superseded += 1;
                    }
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }

    /// Fail running runs that stopped heartbeating. Returns how many.
    pub async fn reap_stale(&self) -> Result<usize, StoreError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let before = Utc::now() - stale_after;
        let stale = self.runs.list_stale(before).await?;
        let count = stale.len();

        for run in stale {
            let since = run
                .heartbeat_at
                .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
            warn!(run_id = %run.run_id, last_heartbeat = %since, "reaping stale run");
            let error = RunError::Abandoned(format!("no heartbeat since {since}"));
            self.fail_run(run, &error, None).await?;
        }
        Ok(count)
    }

    /// Poll in the background until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(dispatcher = %self.config.name, "dispatcher started");
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        match self.reap_stale().await {
                            Ok(0) => {}
                            Ok(n) => info!(dispatcher = %self.config.name, reaped = n, "reaped stale runs"),
                            Err(e) => error!(dispatcher = %self.config.name, error = %e, "stale run reaping failed"),
                        }
                        match self.dispatch_once().await {
                            Ok(stats) if stats.claimed > 0 || stats.conflicts > 0 => {
                                info!(dispatcher = %self.config.name, ?stats, "dispatch pass finished");
                            }
                            Ok(_) => debug!(dispatcher = %self.config.name, "nothing to dispatch"),
                            Err(e) => error!(dispatcher = %self.config.name, error = %e, "dispatch pass failed"),
                        }
                    }
                }
            }

            info!(dispatcher = %self.config.name, "dispatcher stopped");
        });

        DispatcherHandle { shutdown, join }
    }

    async fn execute_run(&self, run: JobRun) -> Result<RunOutcome, StoreError> {
        let Some(mut job) = self.jobs.get(run.job_id).await? else {
            let error = RunError::JobNotRunnable(format!("job {} does not exist", run.job_id));
            return self.fail_run(run, &error, None).await;
        };

        if let Err(e) = job.mark_running() {
            let error = RunError::JobNotRunnable(e.to_string());
            return self.fail_run(run, &error, None).await;
        }
        job.mark_step(format!("attempt {}/{}", run.attempt, run.max_attempts));
        self.jobs.update(&job).await?;
        journal(
            &*self.jobs,
            NewJobLog::new(job.id, JobLogLevel::Info, "run started").with_data(json!({
                "run_id": run.run_id.to_string(),
                "attempt": run.attempt,
                "max_attempts": run.max_attempts,
            })),
        )
        .await;

        if let Err(e) = job.payload.validate() {
            return self.fail_run(run, &RunError::InvalidPayload(e.to_string()), None).await;
        }
        let job_type = run.job_type;
        let Some(handler) = self.registry.get(job_type) else {
            return self.fail_run(run, &RunError::NoHandler(job_type), None).await;
        };

        let scope = WorkScope::new(job.id, run.run_id, job.subject.clone());
        let progress = RunProgress {
            jobs: self.jobs.clone(),
            runs: self.runs.clone(),
        };
        let started = Instant::now();
        let result = handler
            .execute(RunContext {
                scope: &scope,
                payload: &job.payload,
                progress: &progress,
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(summary) => self.finish_run(run, summary, duration_ms).await,
            Err(failure) => {
                let metrics = RunMetrics::from_summary(&failure.partial, duration_ms);
                self.fail_run(run, &failure.error, Some(metrics)).await
            }
        }
    }

    async fn finish_run(
        &self,
        mut run: JobRun,
        summary: BatchSummary,
        duration_ms: u64,
    ) -> Result<RunOutcome, StoreError> {
        run.mark_succeeded(RunMetrics::from_summary(&summary, duration_ms))
            .map_err(|e| StoreError::invalid(e.to_string()))?;
        if !self.write_held_run(&run).await? {
            return Ok(RunOutcome::LeaseLost);
        }

        if let Some(mut job) = self.jobs.get(run.job_id).await? {
            job.mark_step(format!(
                "done: {} processed, {} updated, {} failed",
                summary.processed, summary.updated, summary.failed
            ));
            if job.mark_done().is_ok() {
                self.jobs.update(&job).await?;
            }
        }

        info!(
            run_id = %run.run_id,
            job_id = %run.job_id,
            processed = summary.processed,
            updated = summary.updated,
            failed = summary.failed,
            duration_ms,
            "run succeeded"
        );
        journal(
            &*self.jobs,
            NewJobLog::new(run.job_id, JobLogLevel::Info, "run succeeded").with_data(json!({
                "run_id": run.run_id.to_string(),
                "metrics": run.metrics,
            })),
        )
        .await;
        Ok(RunOutcome::Succeeded)
    }

    /// Persist a run this dispatcher claimed. `false` when the store no
    /// longer has it as running, i.e. it was reaped while we worked on it.
    async fn write_held_run(&self, run: &JobRun) -> Result<bool, StoreError> {
        match self.runs.update(run).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    run_id = %run.run_id,
                    job_id = %run.job_id,
                    reason = %reason,
                    "lost run lease, dropping outcome"
                );
                journal(
                    &*self.jobs,
                    NewJobLog::new(run.job_id, JobLogLevel::Warn, "run lease lost, outcome dropped")
                        .with_data(json!({ "run_id": run.run_id.to_string(), "reason": reason })),
                )
                .await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_run(
        &self,
        mut run: JobRun,
        error: &RunError,
        metrics: Option<RunMetrics>,
    ) -> Result<RunOutcome, StoreError> {
        let message = error.to_string();
        run.mark_failed(&message, metrics)
            .map_err(|e| StoreError::invalid(e.to_string()))?;
        if !self.write_held_run(&run).await? {
            return Ok(RunOutcome::LeaseLost);
        }

        error!(
            run_id = %run.run_id,
            job_id = %run.job_id,
            attempt = run.attempt,
            max_attempts = run.max_attempts,
            error = %message,
            "run failed"
        );

        let mut job = self.jobs.get(run.job_id).await?;

        if !error.is_fatal() && run.can_retry() {
            let successor = run
                .successor(&self.config.retry_policy)
                .map_err(|e| StoreError::invalid(e.to_string()))?;
            let created = self.runs.create(&successor).await?;
            if created.was_created() {
                if let Some(cursor) = self.checkpoints.get(run.run_id).await? {
                    self.checkpoints.set(successor.run_id, cursor).await?;
                }
                if let Some(job) = job.as_mut() {
                    job.record_retry(truncate_excerpt(&message));
                    job.mark_step(format!(
                        "retrying: attempt {}/{}",
                        successor.attempt, successor.max_attempts
                    ));
                    self.jobs.update(job).await?;
                }
                info!(
                    run_id = %successor.run_id,
                    attempt = successor.attempt,
                    not_before = %successor.not_before,
                    "scheduled successor run"
                );
                journal(
                    &*self.jobs,
                    NewJobLog::new(run.job_id, JobLogLevel::Warn, "run failed, retry scheduled")
                        .with_data(json!({
                            "run_id": run.run_id.to_string(),
                            "error": truncate_excerpt(&message),
                            "next_attempt": successor.attempt,
                            "not_before": successor.not_before,
                        })),
                )
                .await;
            }
            return Ok(RunOutcome::Retried);
        }

        if let Some(job) = job.as_mut() {
            if !job.is_terminal() {
                job.mark_error(truncate_excerpt(&message))
                    .map_err(|e| StoreError::invalid(e.to_string()))?;
                self.jobs.update(job).await?;
                journal(
                    &*self.jobs,
                    NewJobLog::new(job.id, JobLogLevel::Error, "job failed").with_data(json!({
                        "run_id": run.run_id.to_string(),
                        "attempt": run.attempt,
                        "error": truncate_excerpt(&message),
                    })),
                )
                .await;
            }
        }
        Ok(RunOutcome::Failed)
    }
}

/// Append to a job's journal. The journal is advisory, so a failed write
/// never fails the run.
async fn journal(jobs: &dyn JobStore, entry: NewJobLog) {
    let job_id: JobId = entry.job_id;
    if let Err(e) = jobs.append_log(entry).await {
        warn!(job_id = %job_id, error = %e, "failed to append job log");
    }
}

/// Handle to a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop polling and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
    }
}

/// Heartbeats the run and refreshes the job's step after each chunk.
struct RunProgress {
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
}

#[async_trait]
impl ProgressSink for RunProgress {
    async fn chunk_committed(
        &self,
        scope: &WorkScope,
        cursor: Cursor,
        totals: &BatchSummary,
    ) -> Result<(), StoreError> {
        self.runs.heartbeat(scope.run_id).await?;
        if let Some(mut job) = self.jobs.get(scope.job_id).await? {
            job.mark_step(format!(
                "{} processed, {} updated, {} failed ({cursor})",
                totals.processed, totals.updated, totals.failed
            ));
            self.jobs.update(&job).await?;
        }
        journal(
            &*self.jobs,
            NewJobLog::new(scope.job_id, JobLogLevel::Info, "chunk committed").with_data(json!({
                "run_id": scope.run_id.to_string(),
                "cursor": cursor.to_string(),
                "processed": totals.processed,
                "updated": totals.updated,
                "failed": totals.failed,
            })),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::jobs::driver::EchoHandler;
    use crate::jobs::run::RunStatus;
    use crate::jobs::run_store::{InMemoryRunStore, RunFilter};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Job, JobPayload, JobStatus};

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        runs: Arc<InMemoryRunStore>,
        dispatcher: Dispatcher,
    }

    fn fixture(registry: WorkerRegistry) -> Fixture {
        fixture_with(
            registry,
            DispatcherConfig::default().with_retry_policy(RetryPolicy::immediate()),
        )
    }

    fn fixture_with(registry: WorkerRegistry, config: DispatcherConfig) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let runs = InMemoryRunStore::arc();
        let dispatcher = Dispatcher::new(
            jobs.clone(),
            runs.clone(),
            InMemoryCheckpointStore::arc(),
            registry,
            config,
        );
        Fixture {
            jobs,
            runs,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn run_once_job_completes() {
        let fx = fixture(WorkerRegistry::new().with(Arc::new(EchoHandler)));
        let job = Job::new("acme", JobPayload::RunOnce { echo: "hi".into() }).unwrap();
        fx.jobs.insert(&job).await.unwrap();

        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.succeeded, 1);

        let job = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.step.unwrap().starts_with("done"));

        let runs = fx.runs.list_recent(RunFilter::default(), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);

        let logs = fx.jobs.logs(job.id, 10).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["run started", "run succeeded"]);
        assert_eq!(logs[1].data["metrics"]["processed"], 0);

        // nothing left to do
        assert_eq!(fx.dispatcher.dispatch_once().await.unwrap(), DispatchStats::default());
    }

    #[tokio::test]
    async fn missing_handler_fails_job_without_retry() {
        let fx = fixture(WorkerRegistry::new());
        let job = Job::new("acme", JobPayload::EmbeddingBackfill { max_items: None }).unwrap();
        fx.jobs.insert(&job).await.unwrap();

        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!(stats.failed, 1);

        let job = fx.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.retries, 0);
        assert!(job.error.unwrap().contains("no handler"));

        let logs = fx.jobs.logs(job.id, 10).await.unwrap();
        let last = logs.last().unwrap();
        assert_eq!((last.level, last.message.as_str()), (JobLogLevel::Error, "job failed"));
    }

    #[tokio::test]
    async fn reaps_runs_without_heartbeat() {
        let fx = fixture(WorkerRegistry::new().with(Arc::new(EchoHandler)));
        let mut job = Job::new("acme", JobPayload::RunOnce { echo: "x".into() }).unwrap();
        job.mark_running().unwrap();
        fx.jobs.insert(&job).await.unwrap();

        let run = JobRun::first(&job, 3).unwrap();
        fx.runs.create(&run).await.unwrap();
        let mut claimed = fx.runs.claim(run.run_id).await.unwrap();
        claimed.heartbeat_at = Some(Utc::now() - chrono::Duration::hours(1));
        fx.runs.update(&claimed).await.unwrap();

        assert_eq!(fx.dispatcher.reap_stale().await.unwrap(), 1);
        let reaped = fx.runs.get(run.run_id).await.unwrap().unwrap();
        assert_eq!(reaped.status, RunStatus::Failed);
        assert!(reaped.error_excerpt.unwrap().contains("abandoned"));

        // the successor picks the work up on the next pass
        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(fx.jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn reaped_run_finishing_late_loses_its_lease() {
        let fx = fixture(WorkerRegistry::new().with(Arc::new(EchoHandler)));
        let mut job = Job::new("acme", JobPayload::RunOnce { echo: "late".into() }).unwrap();
        job.mark_running().unwrap();
        fx.jobs.insert(&job).await.unwrap();

        let run = JobRun::first(&job, 3).unwrap();
        fx.runs.create(&run).await.unwrap();
        let mut held = fx.runs.claim(run.run_id).await.unwrap();
        held.heartbeat_at = Some(Utc::now() - chrono::Duration::hours(1));
        fx.runs.update(&held).await.unwrap();
        assert_eq!(fx.dispatcher.reap_stale().await.unwrap(), 1);

        // the original driver was still alive and now reports success
        let outcome = fx
            .dispatcher
            .finish_run(held, BatchSummary::default(), 5)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::LeaseLost);
        let logs = fx.jobs.logs(job.id, 10).await.unwrap();
        assert!(logs.iter().any(|l| l.level == JobLogLevel::Warn && l.message.contains("lease lost")));
        let reaped = fx.runs.get(run.run_id).await.unwrap().unwrap();
        assert_eq!(reaped.status, RunStatus::Failed);

        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!((stats.claimed, stats.conflicts, stats.succeeded), (1, 0, 1));
        assert_eq!(fx.jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test]
    async fn blocked_pending_runs_do_not_starve_queued_jobs() {
        let mut config = DispatcherConfig::default().with_retry_policy(RetryPolicy::immediate());
        config.worker_concurrency = 1;
        let fx = fixture_with(WorkerRegistry::new().with(Arc::new(EchoHandler)), config);

        let mut blocked_job = Job::new("acme", JobPayload::RunOnce { echo: "a".into() }).unwrap();
        blocked_job.mark_running().unwrap();
        fx.jobs.insert(&blocked_job).await.unwrap();
        let first = JobRun::first(&blocked_job, 3).unwrap();
        let mut orphan = first.clone();
        orphan.run_id = RunId::new();
        orphan.attempt = 2;
        fx.runs.create(&first).await.unwrap();
        fx.runs.create(&orphan).await.unwrap();
        let mut holder = fx.runs.claim(first.run_id).await.unwrap();

        let queued = Job::new("acme", JobPayload::RunOnce { echo: "b".into() }).unwrap();
        fx.jobs.insert(&queued).await.unwrap();

        // holder still running: the orphan is skipped, the queued job runs
        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!((stats.conflicts, stats.superseded), (1, 0));
        assert_eq!((stats.claimed, stats.succeeded), (1, 1));
        assert_eq!(fx.jobs.get(queued.id).await.unwrap().unwrap().status, JobStatus::Done);

        // once the key succeeded the orphan can never run and is retired
        holder.mark_succeeded(Default::default()).unwrap();
        fx.runs.update(&holder).await.unwrap();
        let stats = fx.dispatcher.dispatch_once().await.unwrap();
        assert_eq!((stats.conflicts, stats.superseded, stats.claimed), (1, 1, 0));

        let orphan = fx.runs.get(orphan.run_id).await.unwrap().unwrap();
        assert_eq!(orphan.status, RunStatus::Failed);
        assert_eq!(fx.dispatcher.dispatch_once().await.unwrap(), DispatchStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_dispatcher_polls_until_shutdown() {
        let fx = fixture(WorkerRegistry::new().with(Arc::new(EchoHandler)));
        let job = Job::new("acme", JobPayload::RunOnce { echo: "bg".into() }).unwrap();
        fx.jobs.insert(&job).await.unwrap();

        let jobs = fx.jobs.clone();
        let handle = Arc::new(fx.dispatcher).spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Done);
        handle.shutdown().await;
    }
}
