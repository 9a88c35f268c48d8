use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use mediarun_core::{Cursor, ItemId, RunId};

use super::CheckpointStore;
use crate::error::{StoreError, map_sqlx_error};

/// Checkpoints in `job_checkpoints`, one row per run.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn get(&self, run_id: RunId) -> Result<Option<Cursor>, StoreError> {
        let row = sqlx::query("SELECT cursor_item_id FROM job_checkpoints WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_checkpoint", e))?;

        match row {
            Some(row) => {
                let id: i64 = row
                    .try_get("cursor_item_id")
                    .map_err(|e| StoreError::invalid(format!("bad checkpoint row: {e}")))?;
                Ok(Some(Cursor::after(ItemId::new(id))))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(run_id = %run_id, cursor = %cursor), err)]
    async fn set(&self, run_id: RunId, cursor: Cursor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_checkpoints (run_id, cursor_item_id)
            VALUES ($1, $2)
            ON CONFLICT (run_id)
            DO UPDATE SET
                cursor_item_id = EXCLUDED.cursor_item_id,
                updated_at = NOW()
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(cursor.item_id().get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_checkpoint", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn purge(&self, run_id: RunId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_checkpoints WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_checkpoint", e))?;
        Ok(())
    }
}
