//! Domain batch workers and their wiring into the dispatcher.

mod embedding;
mod sanitizer;

use std::sync::Arc;

use mediarun_batch::{BoundedExecutor, TokenBucket};

use crate::checkpoint::CheckpointStore;
use crate::clients::{EmbeddingProvider, ImageRewriter};
use crate::config::{LimitSettings, Settings};
use crate::jobs::{EchoHandler, JobStore, JobType, RunDriver, WorkerRegistry};
use crate::media::MediaRepository;

pub use embedding::EmbeddingBackfillWorker;
pub use sanitizer::{ImageSanitizerWorker, SANITIZED_ASSET_KIND};

/// Executor with its own concurrency cap and process-wide token bucket.
pub fn executor_for(name: &str, limits: LimitSettings, settings: &Settings) -> BoundedExecutor {
    BoundedExecutor::new(limits.max_concurrency)
        .with_name(name)
        .with_limiter(Arc::new(TokenBucket::new(limits.max_rps)))
        .with_call_timeout(settings.endpoints.call_timeout)
}

/// Collaborators the built-in handlers need.
pub struct WorkerDeps {
    pub media: Arc<dyn MediaRepository>,
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub rewriter: Arc<dyn ImageRewriter>,
}

/// Registry with a handler for every job type.
pub fn build_registry(settings: &Settings, deps: WorkerDeps) -> WorkerRegistry {
    let chunk_size = settings.dispatch.chunk_size;

    let backfill = RunDriver::new(
        JobType::EmbeddingBackfill,
        Arc::new(EmbeddingBackfillWorker::new(deps.media.clone(), deps.embedder)),
        executor_for("embedding", settings.embed, settings),
        deps.checkpoints.clone(),
    )
    .with_chunk_size(chunk_size);

    let sanitize = RunDriver::new(
        JobType::ImageSanitize,
        Arc::new(ImageSanitizerWorker::new(deps.media, deps.rewriter, deps.jobs)),
        executor_for("sanitizer", settings.sanitize, settings),
        deps.checkpoints,
    )
    .with_chunk_size(chunk_size);

    WorkerRegistry::new()
        .with(Arc::new(backfill))
        .with(Arc::new(sanitize))
        .with(Arc::new(EchoHandler))
}
