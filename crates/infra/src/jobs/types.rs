//! Job model, typed payloads and retry policy.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use mediarun_core::{DomainError, DomainResult, ItemId, JobId};

/// Coarse, user-visible job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Job kind, used to route a run to its handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmbeddingBackfill,
    ImageSanitize,
    RunOnce,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmbeddingBackfill => "embedding_backfill",
            JobType::ImageSanitize => "image_sanitize",
            JobType::RunOnce => "run_once",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedding_backfill" => Ok(JobType::EmbeddingBackfill),
            "image_sanitize" => Ok(JobType::ImageSanitize),
            "run_once" => Ok(JobType::RunOnce),
            other => Err(DomainError::validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Request payload, tagged by job type.
///
/// Serialized as `{"job_type": "...", ...fields}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobPayload {
    EmbeddingBackfill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<u32>,
    },
    ImageSanitize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<u32>,
    },
    /// Diagnostic no-op that only echoes its input into the run log.
    RunOnce { echo: String },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::EmbeddingBackfill { .. } => JobType::EmbeddingBackfill,
            JobPayload::ImageSanitize { .. } => JobType::ImageSanitize,
            JobPayload::RunOnce { .. } => JobType::RunOnce,
        }
    }

    /// Cap on items one run processes; `None` means everything pending.
    pub fn max_items(&self) -> Option<usize> {
        match self {
            JobPayload::EmbeddingBackfill { max_items } | JobPayload::ImageSanitize { max_items } => {
                max_items.map(|n| n as usize)
            }
            JobPayload::RunOnce { .. } => None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            JobPayload::EmbeddingBackfill { max_items: Some(0) }
            | JobPayload::ImageSanitize { max_items: Some(0) } => {
                Err(DomainError::validation("max_items must be at least 1"))
            }
            JobPayload::RunOnce { echo } if echo.len() > 1024 => {
                Err(DomainError::validation("echo must be at most 1024 bytes"))
            }
            _ => Ok(()),
        }
    }
}

/// A user-visible unit of requested bulk work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Target subject, e.g. an account name.
    pub subject: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Free-text progress label.
    pub step: Option<String>,
    /// Run attempts beyond the first, summed over generations.
    pub retries: u32,
    /// Last error message.
    pub error: Option<String>,
    /// Bumped on every re-enqueue; part of the idempotency key.
    pub generation: u32,
    /// Enqueue-time key; at most one job exists per key.
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(subject: impl Into<String>, payload: JobPayload) -> DomainResult<Self> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(DomainError::validation("subject must not be empty"));
        }
        payload.validate()?;

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            subject,
            payload,
            status: JobStatus::Queued,
            step: None,
            retries: 0,
            error: None,
            generation: 0,
            dedupe_key: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn with_dedupe_key(mut self, key: &DedupeKey) -> DomainResult<Self> {
        key.validate()?;
        self.dedupe_key = Some(key.scoped(self.job_type(), &self.subject));
        Ok(self)
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Key identifying the logical unit of work of the current generation.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:g{}", self.job_type(), self.id, self.generation)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `queued -> running`. A job already running stays running (a successor
    /// run picking it up).
    pub fn mark_running(&mut self) -> DomainResult<()> {
        match self.status {
            JobStatus::Queued => {
                let now = Utc::now();
                self.status = JobStatus::Running;
                self.started_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            JobStatus::Running => Ok(()),
            other => Err(DomainError::invalid_transition(format!(
                "job {} cannot start from {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    pub fn mark_step(&mut self, step: impl Into<String>) {
        self.step = Some(step.into());
        self.updated_at = Utc::now();
    }

    /// A failed run is being retried by a successor.
    pub fn record_retry(&mut self, error: impl Into<String>) {
        self.retries += 1;
        self.error = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_done(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::invalid_transition(format!(
                "job {} cannot finish from {}",
                self.id,
                self.status.as_str()
            )));
        }
        let now = Utc::now();
        self.status = JobStatus::Done;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_error(&mut self, error: impl Into<String>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "job {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        let now = Utc::now();
        self.status = JobStatus::Error;
        self.error = Some(error.into());
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `error -> queued` under a fresh generation, so the new attempt series
    /// gets its own idempotency key.
    pub fn requeue(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Error {
            return Err(DomainError::invalid_transition(format!(
                "only failed jobs can be re-enqueued, job {} is {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = JobStatus::Queued;
        self.generation += 1;
        self.error = None;
        self.step = None;
        self.started_at = None;
        self.finished_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What makes two enqueue requests the same logical work.
///
/// Keys are scoped by job type and subject, so the same caller key under
/// another subject is different work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DedupeKey {
    /// Caller-chosen key.
    Explicit(String),
    /// One job per calendar day.
    Date(NaiveDate),
}

pub const MAX_DEDUPE_KEY_LEN: usize = 200;

impl DedupeKey {
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            DedupeKey::Explicit(key) if key.trim().is_empty() => {
                Err(DomainError::validation("dedupe key must not be empty"))
            }
            DedupeKey::Explicit(key) if key.len() > MAX_DEDUPE_KEY_LEN => Err(DomainError::validation(
                format!("dedupe key must be at most {MAX_DEDUPE_KEY_LEN} bytes"),
            )),
            _ => Ok(()),
        }
    }

    pub fn scoped(&self, job_type: JobType, subject: &str) -> String {
        match self {
            DedupeKey::Explicit(key) => format!("{job_type}:{subject}:{key}"),
            DedupeKey::Date(date) => format!("{job_type}:{subject}:{date}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLogLevel {
    Info,
    Warn,
    Error,
}

impl JobLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLogLevel::Info => "info",
            JobLogLevel::Warn => "warn",
            JobLogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for JobLogLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(JobLogLevel::Info),
            "warn" => Ok(JobLogLevel::Warn),
            "error" => Ok(JobLogLevel::Error),
            other => Err(DomainError::validation(format!("unknown log level: {other}"))),
        }
    }
}

/// One line of a job's user-visible history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: JobId,
    pub level: JobLogLevel,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJobLog {
    pub job_id: JobId,
    pub level: JobLogLevel,
    pub message: String,
    pub data: serde_json::Value,
}

impl NewJobLog {
    pub fn new(job_id: JobId, level: JobLogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// An output recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAsset {
    pub id: i64,
    pub job_id: JobId,
    pub kind: String,
    pub url: String,
    pub item_id: ItemId,
    pub created_at: DateTime<Utc>,
}

/// Asset to upsert, keyed by `(job_id, kind, item_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobAsset {
    pub job_id: JobId,
    pub kind: String,
    pub url: String,
    pub item_id: ItemId,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay applied before a successor run may be claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Successors are claimable immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // deterministic jitter keyed on attempt
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backfill() -> JobPayload {
        JobPayload::EmbeddingBackfill { max_items: None }
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(Duration::from_millis(250));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(4));
        assert_eq!(RetryPolicy::immediate().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(Duration::from_millis(1000), Duration::from_secs(60));
        for attempt in 1..12 {
            let nominal = (1000.0 * 2_f64.powi(attempt as i32 - 1)).min(60_000.0);
            let got = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((got - nominal).abs() <= nominal * 0.1 + 1.0, "attempt {attempt}: {got}");
            assert!(got <= 60_000.0, "attempt {attempt}: {got}");
        }
    }

    #[test]
    fn positive_jitter_never_exceeds_max_delay() {
        // attempt 3 draws positive jitter
        let capped = RetryPolicy::exponential(Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(capped.delay_for_attempt(3), Duration::from_secs(60));

        let uncapped = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(600));
        assert!(uncapped.delay_for_attempt(3) > Duration::from_secs(4));
    }

    #[test]
    fn payload_is_tagged_by_job_type() {
        let json = serde_json::to_value(JobPayload::ImageSanitize { max_items: Some(20) }).unwrap();
        assert_eq!(json, serde_json::json!({"job_type": "image_sanitize", "max_items": 20}));

        let parsed: JobPayload =
            serde_json::from_value(serde_json::json!({"job_type": "embedding_backfill"})).unwrap();
        assert_eq!(parsed, backfill());

        let unknown = serde_json::from_value::<JobPayload>(serde_json::json!({"job_type": "nope"}));
        assert!(unknown.is_err());
    }

    #[test]
    fn dedupe_keys_are_scoped_by_type_and_subject() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let job = Job::new("acme", backfill())
            .unwrap()
            .with_dedupe_key(&DedupeKey::Date(day))
            .unwrap();
        assert_eq!(job.dedupe_key.as_deref(), Some("embedding_backfill:acme:2024-03-09"));

        let explicit = DedupeKey::Explicit("nightly".into());
        assert_ne!(
            explicit.scoped(JobType::EmbeddingBackfill, "acme"),
            explicit.scoped(JobType::ImageSanitize, "acme")
        );
        assert!(DedupeKey::Explicit("  ".into()).validate().is_err());
        assert!(DedupeKey::Explicit("k".repeat(MAX_DEDUPE_KEY_LEN + 1)).validate().is_err());
    }

    #[test]
    fn payload_validation() {
        assert!(JobPayload::ImageSanitize { max_items: Some(0) }.validate().is_err());
        assert!(JobPayload::RunOnce { echo: "x".repeat(2000) }.validate().is_err());
        assert!(backfill().validate().is_ok());
        assert!(Job::new("  ", backfill()).is_err());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("acme", backfill()).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.mark_done().is_err());

        job.mark_running().unwrap();
        assert!(job.started_at.is_some());
        job.mark_step("chunk 1");
        job.mark_done().unwrap();

        assert_eq!(job.status, JobStatus::Done);
        assert!(job.finished_at.is_some());
        assert!(job.mark_running().is_err());
        assert!(job.mark_error("late").is_err());
        assert!(job.requeue().is_err());
    }

    #[test]
    fn requeue_bumps_generation_and_key() {
        let mut job = Job::new("acme", backfill()).unwrap();
        let first_key = job.idempotency_key();
        assert_eq!(first_key, format!("embedding_backfill:{}:g0", job.id));

        job.mark_running().unwrap();
        job.record_retry("boom");
        job.mark_error("exhausted").unwrap();
        assert_eq!(job.retries, 1);

        job.requeue().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.generation, 1);
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
        assert_ne!(job.idempotency_key(), first_key);
    }
}
