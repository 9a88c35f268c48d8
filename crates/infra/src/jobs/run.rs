//! Job runs: one durable record per attempt at a job's work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mediarun_batch::BatchSummary;
use mediarun_core::{DomainError, DomainResult, JobId, RunId};

use super::types::{Job, JobType, RetryPolicy};

/// Longest error excerpt stored on a run, in characters.
pub const ERROR_EXCERPT_MAX_CHARS: usize = 1000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    /// Statuses that block another run with the same idempotency key from
    /// starting.
    pub fn holds_key(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Succeeded)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DomainError::validation(format!("unknown run status: {other}"))),
        }
    }
}

/// Identifies one logical unit of work across all of its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }
        Ok(Self(key))
    }

    pub fn for_job(job: &Job) -> Self {
        Self(job.idempotency_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counts recorded when a run ends.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub processed: u64,
    pub updated: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

impl RunMetrics {
    pub fn from_summary(summary: &BatchSummary, duration_ms: u64) -> Self {
        Self {
            processed: summary.processed as u64,
            updated: summary.updated as u64,
            failed: summary.failed as u64,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: RunId,
    pub job_id: JobId,
    pub job_type: JobType,
    pub idempotency_key: IdempotencyKey,
    pub status: RunStatus,
    /// 1-based, never above `max_attempts`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest instant the run may be claimed.
    pub not_before: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error_excerpt: Option<String>,
    pub metrics: Option<RunMetrics>,
}

impl JobRun {
    /// Attempt 1 for the job's current generation.
    pub fn first(job: &Job, max_attempts: u32) -> DomainResult<Self> {
        if max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        let now = Utc::now();
        Ok(Self {
            run_id: RunId::new(),
            job_id: job.id,
            job_type: job.job_type(),
            idempotency_key: IdempotencyKey::for_job(job),
            status: RunStatus::Pending,
            attempt: 1,
            max_attempts,
            created_at: now,
            not_before: now,
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            error_excerpt: None,
            metrics: None,
        })
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Pending && self.not_before <= now
    }

    pub fn mark_running(&mut self) -> DomainResult<()> {
        if self.status != RunStatus::Pending {
            return Err(self.bad_transition("start"));
        }
        let now = Utc::now();
        self.status = RunStatus::Running;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        Ok(())
    }

    pub fn mark_succeeded(&mut self, metrics: RunMetrics) -> DomainResult<()> {
        if self.status != RunStatus::Running {
            return Err(self.bad_transition("succeed"));
        }
        self.status = RunStatus::Succeeded;
        self.ended_at = Some(Utc::now());
        self.metrics = Some(metrics);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str, metrics: Option<RunMetrics>) -> DomainResult<()> {
        if self.status != RunStatus::Running {
            return Err(self.bad_transition("fail"));
        }
        self.status = RunStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error_excerpt = Some(truncate_excerpt(error));
        if metrics.is_some() {
            self.metrics = metrics;
        }
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == RunStatus::Failed && self.attempt < self.max_attempts
    }

    /// Next attempt under the same idempotency key, delayed by `policy`.
    pub fn successor(&self, policy: &RetryPolicy) -> DomainResult<Self> {
        if !self.can_retry() {
            return Err(DomainError::invalid_transition(format!(
                "run {} (attempt {}/{}, {}) has no successor",
                self.run_id,
                self.attempt,
                self.max_attempts,
                self.status.as_str()
            )));
        }
        let now = Utc::now();
        let delay = chrono::Duration::from_std(policy.delay_for_attempt(self.attempt))
            .unwrap_or_else(|_| chrono::Duration::zero());
        Ok(Self {
            run_id: RunId::new(),
            job_id: self.job_id,
            job_type: self.job_type,
            idempotency_key: self.idempotency_key.clone(),
            status: RunStatus::Pending,
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            created_at: now,
            not_before: now + delay,
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            error_excerpt: None,
            metrics: None,
        })
    }

    fn bad_transition(&self, action: &str) -> DomainError {
        DomainError::invalid_transition(format!(
            "run {} cannot {action} from {}",
            self.run_id,
            self.status.as_str()
        ))
    }
}

/// Truncates to [`ERROR_EXCERPT_MAX_CHARS`] characters, never splitting one.
pub fn truncate_excerpt(error: &str) -> String {
    match error.char_indices().nth(ERROR_EXCERPT_MAX_CHARS) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}
