//! Batch worker contract.
//!
//! A domain worker (embedding backfill, image sanitizer, ...) supplies two
//! operations: list the items still needing work, and process one of them.
//! The executor, run driver and checkpoint store are generic over this.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use mediarun_core::{Cursor, ItemId, JobId, RunId};

/// Something a batch worker can process.
pub trait BatchItem: Send + Sync + 'static {
    /// Stable, totally ordered id used for result attribution and checkpoints.
    fn item_id(&self) -> ItemId;
}

/// What a run is working on, handed to every worker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkScope {
    pub job_id: JobId,
    pub run_id: RunId,
    /// Target subject (e.g. account name) whose items are processed.
    pub subject: String,
}

impl WorkScope {
    pub fn new(job_id: JobId, run_id: RunId, subject: impl Into<String>) -> Self {
        Self {
            job_id,
            run_id,
            subject: subject.into(),
        }
    }
}

/// Failure of a single item.
///
/// Transient and permanent item failures share one bucket: the executor
/// counts them and moves on, the run decides whether another attempt is
/// worthwhile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ItemError {
    #[error("remote service returned status {status}: {detail}")]
    Remote { status: u16, detail: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed item: {0}")]
    Malformed(String),

    #[error("failed to persist result: {0}")]
    Persist(String),

    #[error("item handler panicked: {0}")]
    Panicked(String),
}

impl ItemError {
    pub fn remote(status: u16, detail: impl Into<String>) -> Self {
        Self::Remote {
            status,
            detail: detail.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn persist(msg: impl Into<String>) -> Self {
        Self::Persist(msg.into())
    }
}

/// Failure outside the per-item boundary (e.g. the item source is unreachable).
///
/// These fail the whole run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("failed to fetch pending items: {0}")]
    Fetch(String),

    #[error("worker misconfigured: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }
}

/// Domain logic for one kind of batch work.
///
/// `process_one` must be idempotent per item: after a crash, every item of
/// the chunk that was in flight is processed again.
#[async_trait]
pub trait BatchWorker: Send + Sync + 'static {
    type Item: BatchItem;

    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Items still needing work, in ascending id order, strictly after
    /// `after` when given, at most `limit` of them.
    async fn fetch_pending(
        &self,
        scope: &WorkScope,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<Self::Item>, WorkerError>;

    /// Perform the remote call for one item and persist its result.
    async fn process_one(&self, scope: &WorkScope, item: Self::Item) -> Result<(), ItemError>;
}
