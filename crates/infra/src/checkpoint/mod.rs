//! Durable resume cursors, one per run.
//!
//! `set` is last-write-wins: a run has a single active writer, and the run
//! driver only ever passes cursors that move forward.

mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use mediarun_core::{Cursor, RunId};

use crate::error::StoreError;
use crate::jobs::store::poisoned;

pub use postgres::PostgresCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last cursor set for the run; `None` means start from the beginning.
    async fn get(&self, run_id: RunId) -> Result<Option<Cursor>, StoreError>;

    async fn set(&self, run_id: RunId, cursor: Cursor) -> Result<(), StoreError>;

    /// Drop the run's checkpoint. Not called on success; rows stay for audit.
    async fn purge(&self, run_id: RunId) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn get(&self, run_id: RunId) -> Result<Option<Cursor>, StoreError> {
        (**self).get(run_id).await
    }

    async fn set(&self, run_id: RunId, cursor: Cursor) -> Result<(), StoreError> {
        (**self).set(run_id, cursor).await
    }

    async fn purge(&self, run_id: RunId) -> Result<(), StoreError> {
        (**self).purge(run_id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    cursors: RwLock<HashMap<RunId, Cursor>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, run_id: RunId) -> Result<Option<Cursor>, StoreError> {
        Ok(self.cursors.read().map_err(poisoned)?.get(&run_id).copied())
    }

    async fn set(&self, run_id: RunId, cursor: Cursor) -> Result<(), StoreError> {
        self.cursors.write().map_err(poisoned)?.insert(run_id, cursor);
        Ok(())
    }

    async fn purge(&self, run_id: RunId) -> Result<(), StoreError> {
        self.cursors.write().map_err(poisoned)?.remove(&run_id);
        Ok(())
    }
}
