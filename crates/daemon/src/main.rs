use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use mediarun_infra::checkpoint::PostgresCheckpointStore;
use mediarun_infra::clients::{HttpEmbeddingClient, HttpImageRewriter};
use mediarun_infra::config::Settings;
use mediarun_infra::db;
use mediarun_infra::jobs::{Dispatcher, DispatcherConfig, PostgresJobStore, PostgresRunStore};
use mediarun_infra::media::PostgresMediaRepository;
use mediarun_infra::workers::{WorkerDeps, build_registry};

/// Two connections per concurrently driven run, never fewer than four.
fn pool_size(settings: &Settings) -> u32 {
    (settings.dispatch.worker_concurrency as u32).saturating_mul(2).max(4)
}

fn dispatcher(settings: &Settings, pool: PgPool) -> Dispatcher {
    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    let runs = Arc::new(PostgresRunStore::new(pool.clone()));
    let checkpoints = Arc::new(PostgresCheckpointStore::new(pool.clone()));
    let timeout = settings.endpoints.call_timeout;

    let registry = build_registry(
        settings,
        WorkerDeps {
            media: Arc::new(PostgresMediaRepository::new(pool)),
            jobs: jobs.clone(),
            checkpoints: checkpoints.clone(),
            embedder: Arc::new(HttpEmbeddingClient::with_timeout(
                settings.endpoints.embedding.clone(),
                timeout,
            )),
            rewriter: Arc::new(HttpImageRewriter::with_timeout(
                settings.endpoints.sanitizer.clone(),
                timeout,
            )),
        },
    );

    Dispatcher::new(
        jobs,
        runs,
        checkpoints,
        registry,
        DispatcherConfig::from_settings(&settings.dispatch),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mediarun_observability::init();

    let settings = Settings::from_env().context("loading settings")?;
    let database_url = settings.require_database_url()?;

    let pool = db::connect(database_url, pool_size(&settings))
        .await
        .context("connecting to Postgres")?;
    db::ensure_schema(&pool).await.context("applying schema")?;

    tracing::info!(
        worker_concurrency = settings.dispatch.worker_concurrency,
        max_attempts = settings.dispatch.max_attempts,
        poll_interval_ms = settings.dispatch.poll_interval.as_millis() as u64,
        embed_max_rps = settings.embed.max_rps,
        sanitize_max_rps = settings.sanitize.max_rps,
        "starting dispatcher"
    );

    let handle = Arc::new(dispatcher(&settings, pool)).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;

    Ok(())
}
