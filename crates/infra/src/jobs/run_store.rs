//! Run storage and the claim-a-run primitive.
//!
//! `claim` is the single point that moves a run to `running`. It must be
//! atomic against the store: two dispatchers claiming runs that share an
//! idempotency key must not both succeed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mediarun_core::RunId;

use super::run::{JobRun, RunStatus};
use super::store::poisoned;
use super::types::JobType;
use crate::error::StoreError;

/// Excerpt recorded on a pending run retired by [`RunStore::supersede`].
pub const SUPERSEDED_EXCERPT: &str = "superseded: idempotency key already succeeded";

/// Result of [`RunStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(JobRun),
    /// A run with the same `(idempotency_key, attempt)` already existed.
    Existing(JobRun),
}

impl CreateOutcome {
    pub fn into_run(self) -> JobRun {
        match self {
            CreateOutcome::Created(run) | CreateOutcome::Existing(run) => run,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Optional filters for run listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub job_type: Option<JobType>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn matches(&self, run: &JobRun) -> bool {
        self.job_type.is_none_or(|t| t == run.job_type)
            && self.status.is_none_or(|s| s == run.status)
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a run unless one exists for the same key and attempt.
    async fn create(&self, run: &JobRun) -> Result<CreateOutcome, StoreError>;

    /// Atomically move a pending run to `running`.
    ///
    /// `Conflict` if the run is no longer pending or another run with the
    /// same idempotency key is running or succeeded.
    async fn claim(&self, run_id: RunId) -> Result<JobRun, StoreError>;

    /// Write back a run this process holds.
    ///
    /// Only a run stored as `running` accepts writes, so a writer whose run
    /// was reaped meanwhile gets `Conflict` instead of overwriting the
    /// terminal state. Never used to enter `running`.
    async fn update(&self, run: &JobRun) -> Result<(), StoreError>;

    /// Fail a pending run whose idempotency key is already held by a
    /// succeeded run. Returns whether the run was retired.
    async fn supersede(&self, run_id: RunId) -> Result<bool, StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>, StoreError>;

    /// Pending runs claimable at `now`, earliest `not_before` first.
    async fn next_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRun>, StoreError>;

    /// Newest runs first.
    async fn list_recent(&self, filter: RunFilter, limit: usize) -> Result<Vec<JobRun>, StoreError>;

    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError>;

    /// Running runs whose last heartbeat is older than `before`.
    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<JobRun>, StoreError>;
}

#[async_trait]
impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    async fn create(&self, run: &JobRun) -> Result<CreateOutcome, StoreError> {
        (**self).create(run).await
    }

    async fn claim(&self, run_id: RunId) -> Result<JobRun, StoreError> {
        (**self).claim(run_id).await
    }

    async fn update(&self, run: &JobRun) -> Result<(), StoreError> {
        (**self).update(run).await
    }

    async fn supersede(&self, run_id: RunId) -> Result<bool, StoreError> {
        (**self).supersede(run_id).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>, StoreError> {
        (**self).get(run_id).await
    }

    async fn next_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        (**self).next_pending(now, limit).await
    }

    async fn list_recent(&self, filter: RunFilter, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        (**self).list_recent(filter, limit).await
    }

    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError> {
        (**self).heartbeat(run_id).await
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<JobRun>, StoreError> {
        (**self).list_stale(before).await
    }
}

/// In-memory run store for tests/dev.
///
/// Every check-then-write happens under one write lock, which gives the same
/// serialization the Postgres partial unique index provides.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, JobRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &JobRun) -> Result<CreateOutcome, StoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        if let Some(existing) = runs
            .values()
            .find(|r| r.idempotency_key == run.idempotency_key && r.attempt == run.attempt)
        {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        if run.attempt > run.max_attempts {
            return Err(StoreError::invalid(format!(
                "attempt {} exceeds max_attempts {}",
                run.attempt, run.max_attempts
            )));
        }
        runs.insert(run.run_id, run.clone());
        Ok(CreateOutcome::Created(run.clone()))
    }

    async fn claim(&self, run_id: RunId) -> Result<JobRun, StoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let candidate = runs
            .get(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;

        if candidate.status != RunStatus::Pending {
            return Err(StoreError::conflict(format!(
                "run {run_id} is {}",
                candidate.status.as_str()
            )));
        }
        if let Some(holder) = runs.values().find(|r| {
            r.run_id != run_id
                && r.idempotency_key == candidate.idempotency_key
                && r.status.holds_key()
        }) {
            return Err(StoreError::conflict(format!(
                "idempotency key {} held by run {} ({})",
                holder.idempotency_key,
                holder.run_id,
                holder.status.as_str()
            )));
        }

        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        run.mark_running()
            .map_err(|e| StoreError::conflict(e.to_string()))?;
        Ok(run.clone())
    }

    async fn update(&self, run: &JobRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let existing = runs
            .get_mut(&run.run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {}", run.run_id)))?;
        if existing.status != RunStatus::Running {
            return Err(StoreError::conflict(format!(
                "run {} is {}",
                run.run_id,
                existing.status.as_str()
            )));
        }
        *existing = run.clone();
        Ok(())
    }

    async fn supersede(&self, run_id: RunId) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let Some(candidate) = runs.get(&run_id) else {
            return Err(StoreError::not_found(format!("run {run_id}")));
        };
        if candidate.status != RunStatus::Pending {
            return Ok(false);
        }
        let key = candidate.idempotency_key.clone();
        let held = runs
            .values()
            .any(|r| r.run_id != run_id && r.idempotency_key == key && r.status == RunStatus::Succeeded);
        if !held {
            return Ok(false);
        }

        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.ended_at = Some(now);
        run.error_excerpt = Some(SUPERSEDED_EXCERPT.to_string());
        Ok(true)
    }

    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>, StoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn next_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut ready: Vec<JobRun> = runs.values().filter(|r| r.is_ready(now)).cloned().collect();
        ready.sort_by(|a, b| a.not_before.cmp(&b.not_before).then(a.run_id.cmp(&b.run_id)));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn list_recent(&self, filter: RunFilter, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        let mut matching: Vec<JobRun> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(poisoned)?;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::conflict(format!(
                "run {run_id} is {}",
                run.status.as_str()
            )));
        }
        run.heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<JobRun>, StoreError> {
        let runs = self.runs.read().map_err(poisoned)?;
        Ok(runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.heartbeat_at.is_none_or(|h| h < before))
            .cloned()
            .collect())
    }
}
