//! Jobs, runs and their orchestration.
//!
//! ## Components
//!
//! - `Job`: user-visible unit of requested work with coarse status and step
//! - `JobRun`: one attempt at a job's work, carrying the idempotency key
//! - `JobStore` / `RunStore`: persistence (in-memory or Postgres)
//! - `RunDriver`: walks a batch worker over pending items with checkpoints
//! - `Dispatcher`: claims runs, drives them, records outcomes and retries
//! - `JobService`: enqueue (optionally deduplicated), status polling, job
//!   logs and listings

pub mod dispatcher;
pub mod driver;
pub mod postgres;
pub mod run;
pub mod run_store;
pub mod service;
pub mod store;
pub mod types;

pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig, DispatcherHandle, WorkerRegistry};
pub use driver::{EchoHandler, ProgressSink, RunContext, RunDriver, RunError, RunFailure, RunHandler};
pub use postgres::{PostgresJobStore, PostgresRunStore};
pub use run::{IdempotencyKey, JobRun, RunMetrics, RunStatus};
pub use run_store::{CreateOutcome, InMemoryRunStore, RunFilter, RunStore, SUPERSEDED_EXCERPT};
pub use service::{
    EnqueueError, Enqueued, JobService, JobStatusOutcome, JobStatusView, RunQuery, MAX_BACKFILL_DAYS,
};
pub use store::{InMemoryJobStore, JobStore};
pub use types::{
    BackoffStrategy, DedupeKey, Job, JobAsset, JobLogEntry, JobLogLevel, JobPayload, JobStatus,
    JobType, MAX_DEDUPE_KEY_LEN, NewJobAsset, NewJobLog, RetryPolicy,
};
