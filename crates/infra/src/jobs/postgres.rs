//! Postgres-backed job and run stores.
//!
//! The at-most-one-active-run rule is enforced by the partial unique index
//! `job_runs_active_key_idx`: a claim that would make a second run with the
//! same idempotency key `running` fails with a unique violation, which maps
//! to `StoreError::Conflict`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use mediarun_core::{ItemId, JobId, RunId};

use super::run::{IdempotencyKey, JobRun, RunMetrics, RunStatus};
use super::run_store::{CreateOutcome, RunFilter, RunStore, SUPERSEDED_EXCERPT};
use super::store::JobStore;
use super::types::{
    Job, JobAsset, JobLogEntry, JobLogLevel, JobPayload, JobStatus, NewJobAsset, NewJobLog,
};
use crate::error::{StoreError, map_sqlx_error};

const JOB_COLUMNS: &str = "id, subject, payload, status, step, retries, error, generation, \
     dedupe_key, created_at, updated_at, started_at, finished_at";

const JOB_INSERT: &str = r#"
    INSERT INTO jobs (
        id, subject, job_type, payload, status, step, retries, error,
        generation, dedupe_key, created_at, updated_at, started_at, finished_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
"#;

const RUN_COLUMNS: &str = "run_id, job_id, job_type, idempotency_key, status, attempt, \
     max_attempts, created_at, not_before, started_at, ended_at, heartbeat_at, error_excerpt, metrics";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type()), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        bind_job(sqlx::query(JOB_INSERT), job)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, dedupe_key = ?job.dedupe_key), err)]
    async fn insert_deduped(&self, job: &Job) -> Result<Option<Job>, StoreError> {
        let Some(key) = job.dedupe_key.as_deref() else {
            self.insert(job).await?;
            return Ok(None);
        };

        let sql = format!(
            "{JOB_INSERT} ON CONFLICT (dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING RETURNING id"
        );
        let inserted = bind_job(sqlx::query(&sql), job)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job_deduped", e))?;
        if inserted.is_some() {
            return Ok(None);
        }

        debug!("job already exists for dedupe key");
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE dedupe_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job_deduped_existing", e))?;
        job_from_row(&row).map(Some)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = job.status.as_str()), err)]
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                payload = $2,
                status = $3,
                step = $4,
                retries = $5,
                error = $6,
                generation = $7,
                updated_at = $8,
                started_at = $9,
                finished_at = $10
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(Json(&job.payload))
        .bind(job.status.as_str())
        .bind(job.step.as_deref())
        .bind(job.retries as i32)
        .bind(job.error.as_deref())
        .bind(job.generation as i32)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("job {}", job.id)));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'queued' ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_queued", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_recent_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, asset), fields(job_id = %asset.job_id, kind = %asset.kind, item_id = %asset.item_id), err)]
    async fn upsert_asset(&self, asset: NewJobAsset) -> Result<JobAsset, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_assets (job_id, kind, url, item_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, kind, item_id)
            DO UPDATE SET url = EXCLUDED.url
            RETURNING id, job_id, kind, url, item_id, created_at
            "#,
        )
        .bind(asset.job_id.as_uuid())
        .bind(&asset.kind)
        .bind(&asset.url)
        .bind(asset.item_id.get())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_asset", e))?;
        asset_from_row(&row)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn assets(&self, job_id: JobId) -> Result<Vec<JobAsset>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, kind, url, item_id, created_at
            FROM job_assets
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_assets", e))?;
        rows.iter().map(asset_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, level = entry.level.as_str()), err)]
    async fn append_log(&self, entry: NewJobLog) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_logs (job_id, level, message, data) VALUES ($1, $2, $3, $4)")
            .bind(entry.job_id.as_uuid())
            .bind(entry.level.as_str())
            .bind(&entry.message)
            .bind(Json(&entry.data))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn logs(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, level, message, data, created_at
            FROM (
                SELECT id, job_id, level, message, data, created_at
                FROM job_logs
                WHERE job_id = $1
                ORDER BY id DESC
                LIMIT $2
            ) AS latest
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_logs", e))?;
        rows.iter().map(log_from_row).collect()
    }
}

fn bind_job<'q>(
    query: Query<'q, Postgres, PgArguments>,
    job: &'q Job,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(job.id.as_uuid())
        .bind(&job.subject)
        .bind(job.job_type().as_str())
        .bind(Json(&job.payload))
        .bind(job.status.as_str())
        .bind(job.step.as_deref())
        .bind(job.retries as i32)
        .bind(job.error.as_deref())
        .bind(job.generation as i32)
        .bind(job.dedupe_key.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
}

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn status_of(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM job_runs WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("run_status", e))?;
        row.map(|r| parse_column::<RunStatus>(&r, "status")).transpose()
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(
        skip(self, run),
        fields(run_id = %run.run_id, idempotency_key = %run.idempotency_key, attempt = run.attempt),
        err
    )]
    async fn create(&self, run: &JobRun) -> Result<CreateOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_runs (
                run_id, job_id, job_type, idempotency_key, status, attempt,
                max_attempts, created_at, not_before
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key, attempt) DO NOTHING
            RETURNING run_id
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(run.job_id.as_uuid())
        .bind(run.job_type.as_str())
        .bind(run.idempotency_key.as_str())
        .bind(run.status.as_str())
        .bind(run.attempt as i32)
        .bind(run.max_attempts as i32)
        .bind(run.created_at)
        .bind(run.not_before)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_run", e))?;

        if inserted.is_some() {
            return Ok(CreateOutcome::Created(run.clone()));
        }

        debug!("run already exists for key and attempt");
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs WHERE idempotency_key = $1 AND attempt = $2"
        );
        let row = sqlx::query(&sql)
            .bind(run.idempotency_key.as_str())
            .bind(run.attempt as i32)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_run_existing", e))?;
        Ok(CreateOutcome::Existing(run_from_row(&row)?))
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn claim(&self, run_id: RunId) -> Result<JobRun, StoreError> {
        let sql = format!(
            r#"
            UPDATE job_runs SET
                status = 'running',
                started_at = NOW(),
                heartbeat_at = NOW()
            WHERE run_id = $1 AND status = 'pending'
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_run", e))?;

        match row {
            Some(row) => run_from_row(&row),
            None => match self.status_of(run_id).await? {
                Some(status) => Err(StoreError::conflict(format!(
                    "run {run_id} is {}",
                    status.as_str()
                ))),
                None => Err(StoreError::not_found(format!("run {run_id}"))),
            },
        }
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, status = run.status.as_str()), err)]
    async fn update(&self, run: &JobRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs SET
                status = $2,
                not_before = $3,
                started_at = $4,
                ended_at = $5,
                heartbeat_at = $6,
                error_excerpt = $7,
                metrics = $8
            WHERE run_id = $1 AND status = 'running'
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(run.status.as_str())
        .bind(run.not_before)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.heartbeat_at)
        .bind(run.error_excerpt.as_deref())
        .bind(run.metrics.map(Json))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_run", e))?;

        if result.rows_affected() == 0 {
            return match self.status_of(run.run_id).await? {
                Some(status) => Err(StoreError::conflict(format!(
                    "run {} is {}",
                    run.run_id,
                    status.as_str()
                ))),
                None => Err(StoreError::not_found(format!("run {}", run.run_id))),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn supersede(&self, run_id: RunId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs AS r SET
                status = 'failed',
                ended_at = NOW(),
                error_excerpt = $2
            WHERE r.run_id = $1
                AND r.status = 'pending'
                AND EXISTS (
                    SELECT 1 FROM job_runs AS s
                    WHERE s.idempotency_key = r.idempotency_key
                        AND s.status = 'succeeded'
                        AND s.run_id <> r.run_id
                )
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(SUPERSEDED_EXCERPT)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("supersede_run", e))?;

        if result.rows_affected() == 0 && self.status_of(run_id).await?.is_none() {
            return Err(StoreError::not_found(format!("run {run_id}")));
        }
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn get(&self, run_id: RunId) -> Result<Option<JobRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE run_id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_run", e))?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn next_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM job_runs
            WHERE status = 'pending' AND not_before <= $1
            ORDER BY not_before ASC, run_id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("next_pending", e))?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, filter: RunFilter, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM job_runs
            WHERE ($1::text IS NULL OR job_type = $1)
                AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, run_id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.job_type.map(|t| t.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_recent_runs", e))?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn heartbeat(&self, run_id: RunId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE job_runs SET heartbeat_at = NOW() WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() == 0 {
            return match self.status_of(run_id).await? {
                Some(status) => Err(StoreError::conflict(format!(
                    "run {run_id} is {}",
                    status.as_str()
                ))),
                None => Err(StoreError::not_found(format!("run {run_id}"))),
            };
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_stale(&self, before: DateTime<Utc>) -> Result<Vec<JobRun>, StoreError> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM job_runs
            WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY heartbeat_at ASC NULLS FIRST
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stale", e))?;
        rows.iter().map(run_from_row).collect()
    }
}

fn bad_row(e: impl std::fmt::Display) -> StoreError {
    StoreError::invalid(format!("failed to decode row: {e}"))
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(bad_row)?;
    raw.parse().map_err(bad_row)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id").map_err(bad_row)?;
    let payload: Json<JobPayload> = row.try_get("payload").map_err(bad_row)?;
    let retries: i32 = row.try_get("retries").map_err(bad_row)?;
    let generation: i32 = row.try_get("generation").map_err(bad_row)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        subject: row.try_get("subject").map_err(bad_row)?,
        payload: payload.0,
        status: parse_column::<JobStatus>(row, "status")?,
        step: row.try_get("step").map_err(bad_row)?,
        retries: retries.max(0) as u32,
        error: row.try_get("error").map_err(bad_row)?,
        generation: generation.max(0) as u32,
        dedupe_key: row.try_get("dedupe_key").map_err(bad_row)?,
        created_at: row.try_get("created_at").map_err(bad_row)?,
        updated_at: row.try_get("updated_at").map_err(bad_row)?,
        started_at: row.try_get("started_at").map_err(bad_row)?,
        finished_at: row.try_get("finished_at").map_err(bad_row)?,
    })
}

fn asset_from_row(row: &PgRow) -> Result<JobAsset, StoreError> {
    let job_id: Uuid = row.try_get("job_id").map_err(bad_row)?;
    let item_id: i64 = row.try_get("item_id").map_err(bad_row)?;
    Ok(JobAsset {
        id: row.try_get("id").map_err(bad_row)?,
        job_id: JobId::from_uuid(job_id),
        kind: row.try_get("kind").map_err(bad_row)?,
        url: row.try_get("url").map_err(bad_row)?,
        item_id: ItemId::new(item_id),
        created_at: row.try_get("created_at").map_err(bad_row)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<JobLogEntry, StoreError> {
    let job_id: Uuid = row.try_get("job_id").map_err(bad_row)?;
    let data: Json<serde_json::Value> = row.try_get("data").map_err(bad_row)?;
    Ok(JobLogEntry {
        id: row.try_get("id").map_err(bad_row)?,
        job_id: JobId::from_uuid(job_id),
        level: parse_column::<JobLogLevel>(row, "level")?,
        message: row.try_get("message").map_err(bad_row)?,
        data: data.0,
        created_at: row.try_get("created_at").map_err(bad_row)?,
    })
}

fn run_from_row(row: &PgRow) -> Result<JobRun, StoreError> {
    let run_id: Uuid = row.try_get("run_id").map_err(bad_row)?;
    let job_id: Uuid = row.try_get("job_id").map_err(bad_row)?;
    let key: String = row.try_get("idempotency_key").map_err(bad_row)?;
    let attempt: i32 = row.try_get("attempt").map_err(bad_row)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(bad_row)?;
    let metrics: Option<Json<RunMetrics>> = row.try_get("metrics").map_err(bad_row)?;

    Ok(JobRun {
        run_id: RunId::from_uuid(run_id),
        job_id: JobId::from_uuid(job_id),
        job_type: parse_column(row, "job_type")?,
        idempotency_key: IdempotencyKey::new(key).map_err(bad_row)?,
        status: parse_column(row, "status")?,
        attempt: attempt.max(1) as u32,
        max_attempts: max_attempts.max(1) as u32,
        created_at: row.try_get("created_at").map_err(bad_row)?,
        not_before: row.try_get("not_before").map_err(bad_row)?,
        started_at: row.try_get("started_at").map_err(bad_row)?,
        ended_at: row.try_get("ended_at").map_err(bad_row)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(bad_row)?,
        error_excerpt: row.try_get("error_excerpt").map_err(bad_row)?,
        metrics: metrics.map(|m| m.0),
    })
}
