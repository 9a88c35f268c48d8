//! Operations exposed to the request layer.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use mediarun_core::{DomainError, JobId};

use super::run::{JobRun, RunStatus};
use super::run_store::{RunFilter, RunStore};
use super::store::JobStore;
use super::types::{DedupeKey, Job, JobAsset, JobLogEntry, JobPayload, JobStatus, JobType};
use crate::error::StoreError;

pub const DEFAULT_RUN_LIMIT: usize = 30;
pub const MAX_RUN_LIMIT: usize = 200;
pub const DEFAULT_JOB_LIMIT: usize = 10;
pub const DEFAULT_LOG_LIMIT: usize = 50;
/// Widest date range a single backfill request may enqueue, in days.
pub const MAX_BACKFILL_DAYS: i64 = 366;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a deduplicated enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Enqueued {
    pub job_id: JobId,
    /// The key was already taken; `job_id` is the earlier job.
    pub existing: bool,
}

/// What a status poll sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub step: Option<String>,
    pub retries: u32,
    pub error: Option<String>,
    pub assets: Vec<JobAsset>,
}

/// Result of a status poll. Polling never fails: a missing job and an
/// unreachable store are distinct outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobStatusOutcome {
    Found(JobStatusView),
    NotFound,
    Unavailable { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunQuery {
    pub limit: Option<usize>,
    pub job_type: Option<JobType>,
    pub status: Option<RunStatus>,
}

impl RunQuery {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT)
    }
}

#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    runs: Arc<dyn RunStore>,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { jobs, runs }
    }

    /// Validate and persist a queued job. The dispatcher picks it up later.
    pub async fn enqueue_job(
        &self,
        subject: impl Into<String>,
        payload: JobPayload,
    ) -> Result<JobId, EnqueueError> {
        let job = Job::new(subject, payload)?;
        self.jobs.insert(&job).await?;
        info!(job_id = %job.id, job_type = %job.job_type(), subject = %job.subject, "job enqueued");
        Ok(job.id)
    }

    /// Enqueue unless a job with the same key already exists for this job
    /// type and subject, in which case the earlier job is returned. Callers
    /// that want to force a fresh job use `enqueue_job`.
    pub async fn enqueue_job_deduped(
        &self,
        subject: impl Into<String>,
        payload: JobPayload,
        key: &DedupeKey,
    ) -> Result<Enqueued, EnqueueError> {
        let job = Job::new(subject, payload)?.with_dedupe_key(key)?;
        match self.jobs.insert_deduped(&job).await? {
            Some(existing) => {
                info!(
                    job_id = %existing.id,
                    dedupe_key = ?existing.dedupe_key,
                    "duplicate enqueue, returning existing job"
                );
                Ok(Enqueued {
                    job_id: existing.id,
                    existing: true,
                })
            }
            None => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type(),
                    subject = %job.subject,
                    dedupe_key = ?job.dedupe_key,
                    "job enqueued"
                );
                Ok(Enqueued {
                    job_id: job.id,
                    existing: false,
                })
            }
        }
    }

    /// One deduplicated job per day in `start..=end`. Days that already have
    /// a job are reported as existing, so re-running a backfill is harmless.
    pub async fn enqueue_date_range(
        &self,
        subject: impl Into<String>,
        payload: JobPayload,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(NaiveDate, Enqueued)>, EnqueueError> {
        if start > end {
            return Err(
                DomainError::validation(format!("range start {start} is after end {end}")).into(),
            );
        }
        let days = (end - start).num_days() + 1;
        if days > MAX_BACKFILL_DAYS {
            return Err(DomainError::validation(format!(
                "range covers {days} days, at most {MAX_BACKFILL_DAYS} allowed"
            ))
            .into());
        }

        let subject = subject.into();
        let mut out = Vec::with_capacity(days as usize);
        for date in start.iter_days().take(days as usize) {
            let enqueued = self
                .enqueue_job_deduped(subject.clone(), payload.clone(), &DedupeKey::Date(date))
                .await?;
            out.push((date, enqueued));
        }
        Ok(out)
    }

    pub async fn get_job_status(&self, job_id: JobId) -> JobStatusOutcome {
        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return JobStatusOutcome::NotFound,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "status lookup failed");
                return JobStatusOutcome::Unavailable {
                    message: e.to_string(),
                };
            }
        };

        let assets = match self.jobs.assets(job_id).await {
            Ok(assets) => assets,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "asset lookup failed");
                return JobStatusOutcome::Unavailable {
                    message: e.to_string(),
                };
            }
        };

        JobStatusOutcome::Found(JobStatusView {
            job_id: job.id,
            job_type: job.job_type(),
            status: job.status,
            step: job.step,
            retries: job.retries,
            error: job.error,
            assets,
        })
    }

    /// Newest first; limit defaults to 30 and is capped at 200.
    pub async fn list_recent_runs(&self, query: RunQuery) -> Result<Vec<JobRun>, StoreError> {
        let filter = RunFilter {
            job_type: query.job_type,
            status: query.status,
        };
        self.runs.list_recent(filter, query.effective_limit()).await
    }

    pub async fn list_recent_jobs(&self, limit: Option<usize>) -> Result<Vec<Job>, StoreError> {
        let limit = limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_RUN_LIMIT);
        self.jobs.list_recent(limit).await
    }

    /// Latest journal entries of a job, oldest first. Limit defaults to 50
    /// and is capped at 200.
    pub async fn job_logs(
        &self,
        job_id: JobId,
        limit: Option<usize>,
    ) -> Result<Vec<JobLogEntry>, EnqueueError> {
        if self.jobs.get(job_id).await?.is_none() {
            return Err(EnqueueError::NotFound(job_id));
        }
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_RUN_LIMIT);
        Ok(self.jobs.logs(job_id, limit).await?)
    }

    /// Move a failed job back to `queued` under a new generation.
    pub async fn requeue_job(&self, job_id: JobId) -> Result<Job, EnqueueError> {
        let mut job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(EnqueueError::NotFound(job_id))?;
        job.requeue()?;
        self.jobs.update(&job).await?;
        info!(job_id = %job.id, generation = job.generation, "job re-enqueued");
        Ok(job)
    }
}
