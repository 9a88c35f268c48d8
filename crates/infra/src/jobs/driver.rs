//! Drives one run of a batch worker to completion.
//!
//! Items are walked in ascending id order, one chunk at a time. After every
//! chunk the checkpoint moves to the chunk's last id, so a later attempt of
//! the same unit of work starts strictly after it. A chunk in which nothing
//! succeeded aborts the run and leaves the checkpoint where it was.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use mediarun_batch::{
    BatchItem, BatchSummary, BatchWorker, BoundedExecutor, ExecutorError, WorkScope, WorkerError,
};
use mediarun_core::{Cursor, ItemId};

use super::types::{JobPayload, JobType};
use crate::checkpoint::CheckpointStore;
use crate::error::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("executor failure: {0}")]
    Executor(#[from] ExecutorError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("every item of the chunk ending at {last} failed ({failed} items), first error: {first_error}")]
    ChunkFailed {
        last: ItemId,
        failed: usize,
        first_error: String,
    },

    #[error("no item succeeded out of {processed}")]
    NothingSucceeded { processed: usize },

    #[error("run abandoned: {0}")]
    Abandoned(String),

    #[error("job cannot run: {0}")]
    JobNotRunnable(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no handler registered for job type {0}")]
    NoHandler(JobType),
}

impl RunError {
    /// Fatal errors fail the job without spending further attempts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RunError::InvalidPayload(_)
                | RunError::JobNotRunnable(_)
                | RunError::NoHandler(_)
                | RunError::Worker(WorkerError::Config(_))
        )
    }
}

/// A run-level failure together with what was done before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub error: RunError,
    pub partial: BatchSummary,
}

impl RunFailure {
    pub fn new(error: impl Into<RunError>, partial: BatchSummary) -> Self {
        Self {
            error: error.into(),
            partial,
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (after {} processed, {} updated, {} failed)",
            self.error, self.partial.processed, self.partial.updated, self.partial.failed
        )
    }
}

/// Receives progress after each committed chunk.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn chunk_committed(
        &self,
        scope: &WorkScope,
        cursor: Cursor,
        totals: &BatchSummary,
    ) -> Result<(), StoreError>;
}

/// Everything a handler gets for one run.
pub struct RunContext<'a> {
    pub scope: &'a WorkScope,
    pub payload: &'a JobPayload,
    pub progress: &'a dyn ProgressSink,
}

/// Executes the work of one run. Implemented once per job type.
#[async_trait]
pub trait RunHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, ctx: RunContext<'_>) -> Result<BatchSummary, RunFailure>;
}

pub struct RunDriver<W: BatchWorker> {
    job_type: JobType,
    worker: Arc<W>,
    executor: BoundedExecutor,
    checkpoints: Arc<dyn CheckpointStore>,
    chunk_size: usize,
}

impl<W: BatchWorker> RunDriver<W> {
    pub fn new(
        job_type: JobType,
        worker: Arc<W>,
        executor: BoundedExecutor,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            job_type,
            worker,
            executor,
            checkpoints,
            chunk_size: 50,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Process everything pending after the run's checkpoint, at most
    /// `max_items` items.
    pub async fn drive(
        &self,
        scope: &WorkScope,
        max_items: Option<usize>,
        progress: &dyn ProgressSink,
    ) -> Result<BatchSummary, RunFailure> {
        let mut totals = BatchSummary::default();
        let mut cursor = self
            .checkpoints
            .get(scope.run_id)
            .await
            .map_err(|e| RunFailure::new(e, totals))?;

        info!(
            worker = self.worker.name(),
            run_id = %scope.run_id,
            resume_after = ?cursor.map(|c| c.item_id().get()),
            "driving run"
        );

        loop {
            let remaining = max_items.map(|max| max.saturating_sub(totals.processed));
            if remaining == Some(0) {
                debug!(run_id = %scope.run_id, "max_items reached");
                break;
            }
            let limit = remaining.map_or(self.chunk_size, |r| r.min(self.chunk_size));

            let mut items = self
                .worker
                .fetch_pending(scope, cursor, limit)
                .await
                .map_err(|e| RunFailure::new(e, totals))?;

            // never trust the source to honor the cursor or the order
            items.retain(|item| cursor.is_none_or(|c| c.admits(item.item_id())));
            items.sort_by_key(|item| item.item_id());
            items.truncate(limit);

            let Some(last) = items.last().map(|item| item.item_id()) else {
                break;
            };

            let worker = self.worker.clone();
            let op_scope = scope.clone();
            let report = self
                .executor
                .run(items, move |item: W::Item| {
                    let worker = worker.clone();
                    let scope = op_scope.clone();
                    async move { worker.process_one(&scope, item).await }
                })
                .await
                .map_err(|e| RunFailure::new(e, totals))?;

            if report.is_total_failure() {
                let error = RunError::ChunkFailed {
                    last,
                    failed: report.failed,
                    first_error: report.first_error().unwrap_or("unknown").to_string(),
                };
                warn!(run_id = %scope.run_id, error = %error, "chunk failed entirely");
                totals.absorb(&report);
                return Err(RunFailure::new(error, totals));
            }
            totals.absorb(&report);

            let next = Cursor::after(last);
            self.checkpoints
                .set(scope.run_id, next)
                .await
                .map_err(|e| RunFailure::new(e, totals))?;
            progress
                .chunk_committed(scope, next, &totals)
                .await
                .map_err(|e| RunFailure::new(e, totals))?;
            cursor = Some(next);

            debug!(
                run_id = %scope.run_id,
                cursor = %next,
                processed = totals.processed,
                updated = totals.updated,
                failed = totals.failed,
                "chunk committed"
            );
        }

        if totals.is_total_failure() {
            return Err(RunFailure::new(
                RunError::NothingSucceeded {
                    processed: totals.processed,
                },
                totals,
            ));
        }
        Ok(totals)
    }
}

#[async_trait]
impl<W: BatchWorker> RunHandler for RunDriver<W> {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, ctx: RunContext<'_>) -> Result<BatchSummary, RunFailure> {
        if ctx.payload.job_type() != self.job_type {
            return Err(RunFailure::new(
                RunError::InvalidPayload(format!(
                    "{} payload routed to {} handler",
                    ctx.payload.job_type(),
                    self.job_type
                )),
                BatchSummary::default(),
            ));
        }
        self.drive(ctx.scope, ctx.payload.max_items(), ctx.progress).await
    }
}

/// Handler for `run_once`: logs the echo and touches no items.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl RunHandler for EchoHandler {
    fn job_type(&self) -> JobType {
        JobType::RunOnce
    }

    async fn execute(&self, ctx: RunContext<'_>) -> Result<BatchSummary, RunFailure> {
        match ctx.payload {
            JobPayload::RunOnce { echo } => {
                info!(job_id = %ctx.scope.job_id, run_id = %ctx.scope.run_id, echo = %echo, "run_once");
                Ok(BatchSummary::default())
            }
            other => Err(RunFailure::new(
                RunError::InvalidPayload(format!("{} payload routed to run_once", other.job_type())),
                BatchSummary::default(),
            )),
        }
    }
}
