use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use mediarun_core::{Cursor, ItemId};

use super::{MediaItem, MediaNeed, MediaRepository};
use crate::error::{StoreError, map_sqlx_error};

/// Media items in the `media_items` table.
#[derive(Debug, Clone)]
pub struct PostgresMediaRepository {
    pool: Arc<PgPool>,
}

impl PostgresMediaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl MediaRepository for PostgresMediaRepository {
    #[instrument(skip(self), err)]
    async fn pending(
        &self,
        subject: &str,
        need: MediaNeed,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, StoreError> {
        let sql = match need {
            MediaNeed::Embedding => {
                r#"
                SELECT id, subject, source_url
                FROM media_items
                WHERE subject = $1 AND id > $2 AND embedding IS NULL
                ORDER BY id ASC
                LIMIT $3
                "#
            }
            MediaNeed::Sanitized => {
                r#"
                SELECT id, subject, source_url
                FROM media_items
                WHERE subject = $1 AND id > $2 AND sanitized_url IS NULL
                ORDER BY id ASC
                LIMIT $3
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(subject)
            .bind(after.map_or(i64::MIN, |c| c.item_id().get()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_media", e))?;

        rows.iter()
            .map(|row| -> Result<MediaItem, StoreError> {
                let id: i64 = row.try_get("id").map_err(bad_row)?;
                Ok(MediaItem {
                    id: ItemId::new(id),
                    subject: row.try_get("subject").map_err(bad_row)?,
                    source_url: row.try_get("source_url").map_err(bad_row)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, embedding), fields(item_id = %id, dims = embedding.len()), err)]
    async fn store_embedding(&self, id: ItemId, embedding: &[f32]) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE media_items SET embedding = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.get())
        .bind(embedding)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_embedding", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("media item {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn store_sanitized(&self, id: ItemId, url: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE media_items SET sanitized_url = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.get())
        .bind(url)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_sanitized", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("media item {id}")));
        }
        Ok(())
    }
}

fn bad_row(e: sqlx::Error) -> StoreError {
    StoreError::invalid(format!("failed to decode media row: {e}"))
}
