use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mediarun_batch::{BatchWorker, ItemError, WorkScope, WorkerError};
use mediarun_core::Cursor;

use crate::clients::{ImageRewriter, RewriteRequest};
use crate::jobs::{JobStore, NewJobAsset};
use crate::media::{MediaItem, MediaNeed, MediaRepository};

pub const SANITIZED_ASSET_KIND: &str = "sanitized_image";

/// Rewrites images through the sanitizer service, stores the new location on
/// the item and records it as a job asset.
pub struct ImageSanitizerWorker {
    media: Arc<dyn MediaRepository>,
    rewriter: Arc<dyn ImageRewriter>,
    jobs: Arc<dyn JobStore>,
}

impl ImageSanitizerWorker {
    pub fn new(
        media: Arc<dyn MediaRepository>,
        rewriter: Arc<dyn ImageRewriter>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            media,
            rewriter,
            jobs,
        }
    }
}

#[async_trait]
impl BatchWorker for ImageSanitizerWorker {
    type Item = MediaItem;

    fn name(&self) -> &'static str {
        "image_sanitizer"
    }

    async fn fetch_pending(
        &self,
        scope: &WorkScope,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, WorkerError> {
        self.media
            .pending(&scope.subject, MediaNeed::Sanitized, after, limit)
            .await
            .map_err(|e| WorkerError::fetch(e.to_string()))
    }

    async fn process_one(&self, scope: &WorkScope, item: MediaItem) -> Result<(), ItemError> {
        if item.source_url.trim().is_empty() {
            return Err(ItemError::malformed(format!("item {} has no source url", item.id)));
        }

        let request = RewriteRequest {
            item_id: item.id,
            source_url: item.source_url,
            subject: scope.subject.clone(),
        };
        let url = self.rewriter.rewrite(&request).await?;

        self.media
            .store_sanitized(item.id, &url)
            .await
            .map_err(|e| ItemError::persist(e.to_string()))?;
        self.jobs
            .upsert_asset(NewJobAsset {
                job_id: scope.job_id,
                kind: SANITIZED_ASSET_KIND.to_string(),
                url,
                item_id: item.id,
            })
            .await
            .map_err(|e| ItemError::persist(e.to_string()))?;

        debug!(item_id = %item.id, "image sanitized");
        Ok(())
    }
}
