//! Media items: the records batch workers walk and write results onto.

mod postgres;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mediarun_batch::BatchItem;
use mediarun_core::{Cursor, ItemId};

use crate::error::StoreError;
use crate::jobs::store::poisoned;

pub use postgres::PostgresMediaRepository;

/// An externally hosted media item belonging to a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: ItemId,
    pub subject: String,
    pub source_url: String,
}

impl BatchItem for MediaItem {
    fn item_id(&self) -> ItemId {
        self.id
    }
}

/// Which per-item result is still missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaNeed {
    Embedding,
    Sanitized,
}

#[async_trait]
pub trait MediaRepository: Send + Sync {
    /// Items of `subject` lacking `need`, ascending id, strictly after `after`.
    async fn pending(
        &self,
        subject: &str,
        need: MediaNeed,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, StoreError>;

    /// Overwrites any previous vector for the item.
    async fn store_embedding(&self, id: ItemId, embedding: &[f32]) -> Result<(), StoreError>;

    /// Overwrites any previous sanitized location for the item.
    async fn store_sanitized(&self, id: ItemId, url: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: MediaRepository + ?Sized> MediaRepository for Arc<S> {
    async fn pending(
        &self,
        subject: &str,
        need: MediaNeed,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, StoreError> {
        (**self).pending(subject, need, after, limit).await
    }

    async fn store_embedding(&self, id: ItemId, embedding: &[f32]) -> Result<(), StoreError> {
        (**self).store_embedding(id, embedding).await
    }

    async fn store_sanitized(&self, id: ItemId, url: &str) -> Result<(), StoreError> {
        (**self).store_sanitized(id, url).await
    }
}

#[derive(Debug, Clone)]
struct MediaRecord {
    item: MediaItem,
    embedding: Option<Vec<f32>>,
    sanitized_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryMediaRepository {
    records: RwLock<BTreeMap<ItemId, MediaRecord>>,
}

impl InMemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Add an item under an explicit id.
    pub fn insert(&self, item: MediaItem) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(
            item.id,
            MediaRecord {
                item,
                embedding: None,
                sanitized_url: None,
            },
        );
        Ok(())
    }

    pub fn embedding(&self, id: ItemId) -> Result<Option<Vec<f32>>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&id).and_then(|r| r.embedding.clone()))
    }

    pub fn sanitized_url(&self, id: ItemId) -> Result<Option<String>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(&id).and_then(|r| r.sanitized_url.clone()))
    }
}

#[async_trait]
impl MediaRepository for InMemoryMediaRepository {
    async fn pending(
        &self,
        subject: &str,
        need: MediaNeed,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<MediaItem>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.item.subject == subject)
            .filter(|r| after.is_none_or(|c| c.admits(r.item.id)))
            .filter(|r| match need {
                MediaNeed::Embedding => r.embedding.is_none(),
                MediaNeed::Sanitized => r.sanitized_url.is_none(),
            })
            .take(limit)
            .map(|r| r.item.clone())
            .collect())
    }

    async fn store_embedding(&self, id: ItemId, embedding: &[f32]) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("media item {id}")))?;
        record.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn store_sanitized(&self, id: ItemId, url: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("media item {id}")))?;
        record.sanitized_url = Some(url.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, subject: &str) -> MediaItem {
        MediaItem {
            id: ItemId::new(id),
            subject: subject.to_string(),
            source_url: format!("https://media.example/{id}.jpg"),
        }
    }

    #[tokio::test]
    async fn pending_filters_by_subject_need_and_cursor() {
        let repo = InMemoryMediaRepository::new();
        for id in 1..=6 {
            repo.insert(item(id, if id % 2 == 0 { "acme" } else { "other" })).unwrap();
        }
        repo.store_embedding(ItemId::new(2), &[0.1, 0.2]).await.unwrap();

        let ids = |items: Vec<MediaItem>| items.into_iter().map(|i| i.id.get()).collect::<Vec<_>>();

        let pending = repo.pending("acme", MediaNeed::Embedding, None, 10).await.unwrap();
        assert_eq!(ids(pending), vec![4, 6]);

        let pending = repo.pending("acme", MediaNeed::Sanitized, None, 10).await.unwrap();
        assert_eq!(ids(pending), vec![2, 4, 6]);

        let after = Some(Cursor::after(ItemId::new(4)));
        let pending = repo.pending("acme", MediaNeed::Sanitized, after, 10).await.unwrap();
        assert_eq!(ids(pending), vec![6]);

        let pending = repo.pending("acme", MediaNeed::Sanitized, None, 1).await.unwrap();
        assert_eq!(ids(pending), vec![2]);
    }

    #[tokio::test]
    async fn writes_are_idempotent_overwrites() {
        let repo = InMemoryMediaRepository::new();
        repo.insert(item(1, "acme")).unwrap();
        repo.store_sanitized(ItemId::new(1), "https://cdn/a").await.unwrap();
        repo.store_sanitized(ItemId::new(1), "https://cdn/a").await.unwrap();
        assert_eq!(repo.sanitized_url(ItemId::new(1)).unwrap().as_deref(), Some("https://cdn/a"));
        assert!(repo.store_embedding(ItemId::new(9), &[1.0]).await.is_err());
    }

    #[test]
    fn poisoned_lock_is_a_storage_error_not_a_missing_value() {
        let repo = InMemoryMediaRepository::arc();
        repo.insert(item(1, "acme")).unwrap();
        let writer = repo.clone();
        let _ = std::thread::spawn(move || {
            let _guard = writer.records.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(repo.embedding(ItemId::new(1)), Err(StoreError::Storage(_))));
        assert!(matches!(repo.sanitized_url(ItemId::new(1)), Err(StoreError::Storage(_))));
    }
}
