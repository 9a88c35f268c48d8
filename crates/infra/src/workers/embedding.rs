use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mediarun_batch::{BatchWorker, ItemError, WorkScope, WorkerError};
use mediarun_core::Cursor;

use crate::clients::EmbeddingProvider;
use crate::media::{MediaItem, MediaNeed, MediaRepository};

/// Computes missing embeddings and writes them onto the item.
pub struct EmbeddingBackfillWorker {
    media: Arc<dyn MediaRepository>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingBackfillWorker {
    pub fn new(media: Arc<dyn MediaRepository>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { media, provider }
    }
}

#[async_trait]
impl BatchWorker for EmbeddingBackfillWorker {
    type Item = MediaItem;

    fn name(&self) -> &'static str {
        "embedding_backfill"
    }

    async fn fetch_pending(
        &self,
        scope: &WorkScope,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, WorkerError> {
        self.media
            .pending(&scope.subject, MediaNeed::Embedding, after, limit)
            .await
            .map_err(|e| WorkerError::fetch(e.to_string()))
    }

    async fn process_one(&self, _scope: &WorkScope, item: MediaItem) -> Result<(), ItemError> {
        if item.source_url.trim().is_empty() {
            return Err(ItemError::malformed(format!("item {} has no source url", item.id)));
        }
        let embedding = self.provider.embed_image(&item.source_url).await?;
        self.media
            .store_embedding(item.id, &embedding)
            .await
            .map_err(|e| ItemError::persist(e.to_string()))?;
        debug!(item_id = %item.id, dims = embedding.len(), "embedding stored");
        Ok(())
    }
}
