//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use mediarun_core::JobId;

use super::types::{Job, JobAsset, JobLogEntry, JobStatus, NewJobAsset, NewJobLog};
use crate::error::StoreError;

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with `Conflict` if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Persist a new job unless one with the same `dedupe_key` exists, in
    /// which case that job is returned and nothing is written. A job without
    /// a key is always inserted.
    async fn insert_deduped(&self, job: &Job) -> Result<Option<Job>, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Overwrite an existing job.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Queued jobs, oldest first.
    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Most recently created jobs first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Insert or replace the asset for `(job_id, kind, item_id)`.
    async fn upsert_asset(&self, asset: NewJobAsset) -> Result<JobAsset, StoreError>;

    /// Assets of a job in ascending id order.
    async fn assets(&self, job_id: JobId) -> Result<Vec<JobAsset>, StoreError>;

    async fn append_log(&self, entry: NewJobLog) -> Result<(), StoreError>;

    /// The latest `limit` log entries of a job, oldest first.
    async fn logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, StoreError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert(job).await
    }

    async fn insert_deduped(&self, job: &Job) -> Result<Option<Job>, StoreError> {
        (**self).insert_deduped(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        (**self).update(job).await
    }

    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).next_queued(limit).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_recent(limit).await
    }

    async fn upsert_asset(&self, asset: NewJobAsset) -> Result<JobAsset, StoreError> {
        (**self).upsert_asset(asset).await
    }

    async fn assets(&self, job_id: JobId) -> Result<Vec<JobAsset>, StoreError> {
        (**self).assets(job_id).await
    }

    async fn append_log(&self, entry: NewJobLog) -> Result<(), StoreError> {
        (**self).append_log(entry).await
    }

    async fn logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, StoreError> {
        (**self).logs(job_id, limit).await
    }
}

pub(crate) fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Storage("in-memory store lock poisoned".to_string())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    assets: RwLock<Vec<JobAsset>>,
    logs: RwLock<Vec<JobLogEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::conflict(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn insert_deduped(&self, job: &Job) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if let Some(key) = job.dedupe_key.as_deref() {
            if let Some(existing) = jobs.values().find(|j| j.dedupe_key.as_deref() == Some(key)) {
                return Ok(Some(existing.clone()));
            }
        }
        if jobs.contains_key(&job.id) {
            return Err(StoreError::conflict(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(None)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::not_found(format!("job {}", job.id))),
        }
    }

    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut queued: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        queued.truncate(limit);
        Ok(queued)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit);
        Ok(all)
    }

    async fn upsert_asset(&self, asset: NewJobAsset) -> Result<JobAsset, StoreError> {
        if !self.jobs.read().map_err(poisoned)?.contains_key(&asset.job_id) {
            return Err(StoreError::not_found(format!("job {}", asset.job_id)));
        }

        let mut assets = self.assets.write().map_err(poisoned)?;
        if let Some(existing) = assets.iter_mut().find(|a| {
            a.job_id == asset.job_id && a.kind == asset.kind && a.item_id == asset.item_id
        }) {
            existing.url = asset.url;
            return Ok(existing.clone());
        }

        let stored = JobAsset {
            id: assets.len() as i64 + 1,
            job_id: asset.job_id,
            kind: asset.kind,
            url: asset.url,
            item_id: asset.item_id,
            created_at: Utc::now(),
        };
        assets.push(stored.clone());
        Ok(stored)
    }

    async fn assets(&self, job_id: JobId) -> Result<Vec<JobAsset>, StoreError> {
        let assets = self.assets.read().map_err(poisoned)?;
        Ok(assets.iter().filter(|a| a.job_id == job_id).cloned().collect())
    }

    async fn append_log(&self, entry: NewJobLog) -> Result<(), StoreError> {
        if !self.jobs.read().map_err(poisoned)?.contains_key(&entry.job_id) {
            return Err(StoreError::not_found(format!("job {}", entry.job_id)));
        }
        let mut logs = self.logs.write().map_err(poisoned)?;
        let id = logs.len() as i64 + 1;
        logs.push(JobLogEntry {
            id,
            job_id: entry.job_id,
            level: entry.level,
            message: entry.message,
            data: entry.data,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, StoreError> {
        let logs = self.logs.read().map_err(poisoned)?;
        let mine: Vec<&JobLogEntry> = logs.iter().filter(|l| l.job_id == job_id).collect();
        let skip = mine.len().saturating_sub(limit);
        Ok(mine.into_iter().skip(skip).cloned().collect())
    }
}
