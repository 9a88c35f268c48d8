//! `mediarun-batch`
//!
//! Runtime building blocks for applying a slow remote operation to many
//! independent items:
//! - [`TokenBucket`]: process-local request-rate ceiling shared by workers
//! - [`BoundedExecutor`]: capped fan-out with partial-failure accounting
//! - [`BatchWorker`]: the contract domain workers implement
//!
//! Nothing here knows about storage; runs, jobs and checkpoints live in
//! `mediarun-infra`.

pub mod executor;
pub mod rate_limit;
pub mod report;
pub mod worker;

pub use executor::{BoundedExecutor, ExecutorError};
pub use rate_limit::TokenBucket;
pub use report::{BatchReport, BatchSummary, ItemOutcome, ItemResult};
pub use worker::{BatchItem, BatchWorker, ItemError, WorkScope, WorkerError};
