//! Cross-component scenarios: service → dispatcher → run driver → executor
//! → worker → stores, all on in-memory stores.
//!
//! Verifies:
//! - A crashed run resumes after its last checkpoint under a new attempt
//! - Claims are exclusive per idempotency key, even when racing
//! - Partial item failures succeed the run; exhausted attempts fail the job
//! - Checkpoints only move forward
//! - The job journal records every attempt and committed chunk

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use mediarun_batch::{
        BatchItem, BatchWorker, BoundedExecutor, ItemError, WorkScope, WorkerError,
    };
    use mediarun_core::{Cursor, ItemId, RunId};

    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::clients::{ClientError, EmbeddingProvider, ImageRewriter, RewriteRequest};
    use crate::config::Settings;
    use crate::error::StoreError;
    use crate::jobs::{
        DispatchStats, Dispatcher, DispatcherConfig, EchoHandler, InMemoryJobStore, InMemoryRunStore, Job,
        JobPayload, JobRun, JobService, JobStatus, JobStatusOutcome, JobStore, JobType,
        RetryPolicy, RunDriver, RunFilter, RunQuery, RunStatus, RunStore, WorkerRegistry,
    };
    use crate::media::{InMemoryMediaRepository, MediaItem};
    use crate::workers::{SANITIZED_ASSET_KIND, WorkerDeps, build_registry};

    // ---------- fixtures ----------

    #[derive(Debug, Clone)]
    struct Num(i64);

    impl BatchItem for Num {
        fn item_id(&self) -> ItemId {
            ItemId::new(self.0)
        }
    }

    /// Items 1..=n, served strictly after the cursor. Keeps no per-item
    /// state, so anything it sees twice was really reprocessed.
    struct Sequence {
        n: i64,
        failing: BTreeSet<i64>,
        /// Fail the fetch that resumes after this id, once.
        crash_after: Mutex<Option<i64>>,
        /// Fail every fetch.
        always_down: AtomicBool,
        calls: Mutex<BTreeMap<i64, usize>>,
        delay: Duration,
    }

    impl Sequence {
        fn new(n: i64) -> Self {
            Self {
                n,
                failing: BTreeSet::new(),
                crash_after: Mutex::new(None),
                always_down: AtomicBool::new(false),
                calls: Mutex::new(BTreeMap::new()),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> BTreeMap<i64, usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchWorker for Sequence {
        type Item = Num;

        fn name(&self) -> &'static str {
            "sequence"
        }

        async fn fetch_pending(
            &self,
            _scope: &WorkScope,
            after: Option<Cursor>,
            limit: usize,
        ) -> Result<Vec<Num>, WorkerError> {
            if self.always_down.load(Ordering::SeqCst) {
                return Err(WorkerError::fetch("media store unreachable"));
            }
            let start = after.map_or(0, |c| c.item_id().get());
            {
                let mut crash = self.crash_after.lock().unwrap();
                if *crash == Some(start) {
                    *crash = None;
                    return Err(WorkerError::fetch("connection reset"));
                }
            }
            Ok((start + 1..=self.n).take(limit).map(Num).collect())
        }

        async fn process_one(&self, _scope: &WorkScope, item: Num) -> Result<(), ItemError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            *self.calls.lock().unwrap().entry(item.0).or_default() += 1;
            if self.failing.contains(&item.0) {
                return Err(ItemError::remote(500, "upstream error"));
            }
            Ok(())
        }
    }

    struct Harness {
        jobs: Arc<InMemoryJobStore>,
        runs: Arc<InMemoryRunStore>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        service: JobService,
    }

    impl Harness {
        fn new() -> Self {
            mediarun_observability::tracing::init_for_tests();
            let jobs = InMemoryJobStore::arc();
            let runs = InMemoryRunStore::arc();
            Self {
                service: JobService::new(jobs.clone(), runs.clone()),
                jobs,
                runs,
                checkpoints: InMemoryCheckpointStore::arc(),
            }
        }

        fn dispatcher(&self, registry: WorkerRegistry, max_attempts: u32) -> Dispatcher {
            Dispatcher::new(
                self.jobs.clone(),
                self.runs.clone(),
                self.checkpoints.clone(),
                registry,
                DispatcherConfig::default()
                    .with_max_attempts(max_attempts)
                    .with_retry_policy(RetryPolicy::immediate()),
            )
        }

        fn sequence_registry(&self, worker: Arc<Sequence>, chunk_size: usize) -> WorkerRegistry {
            let driver = RunDriver::new(
                JobType::EmbeddingBackfill,
                worker,
                BoundedExecutor::new(4),
                self.checkpoints.clone(),
            )
            .with_chunk_size(chunk_size);
            WorkerRegistry::new().with(Arc::new(driver))
        }

        async fn enqueue_backfill(&self) -> mediarun_core::JobId {
            self.service
                .enqueue_job("acme", JobPayload::EmbeddingBackfill { max_items: None })
                .await
                .unwrap()
        }

        async fn job(&self, id: mediarun_core::JobId) -> Job {
            self.jobs.get(id).await.unwrap().unwrap()
        }

        async fn runs_oldest_first(&self) -> Vec<JobRun> {
            let mut runs = self.runs.list_recent(RunFilter::default(), 100).await.unwrap();
            runs.sort_by_key(|r| r.attempt);
            runs
        }
    }

    // ---------- resume ----------

    #[tokio::test]
    async fn crashed_run_resumes_after_checkpoint_on_next_attempt() {
        let h = Harness::new();
        let worker = Arc::new(Sequence::new(50));
        *worker.crash_after.lock().unwrap() = Some(30);
        let dispatcher = h.dispatcher(h.sequence_registry(worker.clone(), 10), 3);
        let job_id = h.enqueue_backfill().await;

        let first = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(first.claimed, 1);
        assert_eq!(first.retried, 1);
        assert_eq!(h.job(job_id).await.status, JobStatus::Running);
        assert_eq!(worker.calls().keys().copied().max(), Some(30));

        let second = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(second.succeeded, 1);

        // every id processed exactly once across both attempts
        let calls = worker.calls();
        assert_eq!(calls.len(), 50);
        assert!(calls.values().all(|&n| n == 1));

        let runs = h.runs_oldest_first().await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error_excerpt.as_deref().unwrap().contains("connection reset"));
        assert_eq!(runs[1].status, RunStatus::Succeeded);
        assert_eq!(runs[1].attempt, 2);
        assert_eq!(runs[0].idempotency_key, runs[1].idempotency_key);
        assert_eq!(runs[1].metrics.map(|m| m.processed), Some(20));

        // the predecessor's checkpoint stays for audit
        assert_eq!(
            h.checkpoints.get(runs[0].run_id).await.unwrap(),
            Some(Cursor::after(ItemId::new(30)))
        );
        assert_eq!(
            h.checkpoints.get(runs[1].run_id).await.unwrap(),
            Some(Cursor::after(ItemId::new(50)))
        );

        let job = h.job(job_id).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.retries, 1);

        // the journal tells the same story, chunk by chunk
        let logs = h.service.job_logs(job_id, None).await.unwrap();
        let count = |m: &str| logs.iter().filter(|l| l.message == m).count();
        assert_eq!(count("run started"), 2);
        assert_eq!(count("chunk committed"), 5);
        assert_eq!(count("run failed, retry scheduled"), 1);
        assert_eq!(logs.last().unwrap().message, "run succeeded");
    }

    // ---------- idempotency ----------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_claims_have_exactly_one_winner() {
        let h = Harness::new();
        let job = Job::new("acme", JobPayload::EmbeddingBackfill { max_items: None }).unwrap();
        h.jobs.insert(&job).await.unwrap();

        // two pending rows under one key, as a misbehaving scheduler would leave
        let first = JobRun::first(&job, 5).unwrap();
        let mut rogue = first.clone();
        rogue.run_id = RunId::new();
        rogue.attempt = 2;
        h.runs.create(&first).await.unwrap();
        h.runs.create(&rogue).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let runs = h.runs.clone();
            let run_id = if i % 2 == 0 { first.run_id } else { rogue.run_id };
            tasks.spawn(async move { runs.claim(run_id).await });
        }

        let mut wins = 0;
        let mut conflicts = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(run) => {
                    assert_eq!(run.status, RunStatus::Running);
                    wins += 1;
                }
                Err(StoreError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 15);

        let running = RunFilter {
            status: Some(RunStatus::Running),
            ..Default::default()
        };
        assert_eq!(h.runs.list_recent(running, 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_dispatchers_process_each_item_once() {
        let h = Harness::new();
        let mut worker = Sequence::new(20);
        worker.delay = Duration::from_millis(5);
        let worker = Arc::new(worker);
        let a = h.dispatcher(h.sequence_registry(worker.clone(), 5), 3);
        let b = h.dispatcher(h.sequence_registry(worker.clone(), 5), 3);
        let job_id = h.enqueue_backfill().await;

        let (sa, sb) = tokio::join!(a.dispatch_once(), b.dispatch_once());
        let (sa, sb) = (sa.unwrap(), sb.unwrap());

        assert_eq!(sa.claimed + sb.claimed, 1);
        assert!(worker.calls().values().all(|&n| n == 1));
        assert_eq!(worker.calls().len(), 20);
        assert_eq!(h.job(job_id).await.status, JobStatus::Done);
    }

    // ---------- outcomes ----------

    #[tokio::test]
    async fn exhausted_attempts_fail_the_job() {
        let h = Harness::new();
        let worker = Arc::new(Sequence::new(10));
        worker.always_down.store(true, Ordering::SeqCst);
        let dispatcher = h.dispatcher(h.sequence_registry(worker, 10), 2);
        let job_id = h.enqueue_backfill().await;

        assert_eq!(dispatcher.dispatch_once().await.unwrap().retried, 1);
        assert_eq!(dispatcher.dispatch_once().await.unwrap().failed, 1);
        assert_eq!(dispatcher.dispatch_once().await.unwrap(), DispatchStats::default());

        let job = h.job(job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.retries, 1);
        assert!(job.error.unwrap().contains("media store unreachable"));

        let runs = h.runs_oldest_first().await;
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
        assert!(runs.iter().all(|r| r.attempt <= r.max_attempts));
    }

    #[tokio::test]
    async fn requeued_job_runs_under_new_key() {
        let h = Harness::new();
        let worker = Arc::new(Sequence::new(5));
        worker.always_down.store(true, Ordering::SeqCst);
        let dispatcher = h.dispatcher(h.sequence_registry(worker.clone(), 10), 1);
        let job_id = h.enqueue_backfill().await;

        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(h.job(job_id).await.status, JobStatus::Error);

        worker.always_down.store(false, Ordering::SeqCst);
        h.service.requeue_job(job_id).await.unwrap();
        assert_eq!(dispatcher.dispatch_once().await.unwrap().succeeded, 1);

        let job = h.job(job_id).await;
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.generation, 1);

        let runs = h.runs_oldest_first().await;
        assert_eq!(runs.len(), 2);
        assert_ne!(runs[0].idempotency_key, runs[1].idempotency_key);
    }

    #[tokio::test]
    async fn all_items_failing_never_counts_as_success() {
        let h = Harness::new();
        let mut worker = Sequence::new(4);
        worker.failing = (1..=4).collect();
        let dispatcher = h.dispatcher(h.sequence_registry(Arc::new(worker), 10), 1);
        let job_id = h.enqueue_backfill().await;

        assert_eq!(dispatcher.dispatch_once().await.unwrap().failed, 1);
        let runs = h.runs_oldest_first().await;
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].metrics.map(|m| (m.updated, m.failed)), Some((0, 4)));
        assert_eq!(h.job(job_id).await.status, JobStatus::Error);
    }

    // ---------- domain workers ----------

    struct FakeEmbedder {
        failing: BTreeSet<String>,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        async fn embed_image(&self, source_url: &str) -> Result<Vec<f32>, ClientError> {
            if self.failing.contains(source_url) {
                return Err(ClientError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            Ok(vec![source_url.len() as f32, 1.0])
        }
    }

    struct FakeRewriter;

    #[async_trait]
    impl ImageRewriter for FakeRewriter {
        async fn rewrite(&self, request: &RewriteRequest) -> Result<String, ClientError> {
            Ok(format!("https://cdn.example/{}/{}.png", request.subject, request.item_id))
        }
    }

    fn url(id: i64) -> String {
        format!("https://media.example/{id}.jpg")
    }

    fn media_with(ids: impl IntoIterator<Item = i64>) -> Arc<InMemoryMediaRepository> {
        let media = InMemoryMediaRepository::arc();
        for id in ids {
            media
                .insert(MediaItem {
                    id: ItemId::new(id),
                    subject: "acme".into(),
                    source_url: url(id),
                })
                .unwrap();
        }
        media
    }

    fn domain_dispatcher(
        h: &Harness,
        media: Arc<InMemoryMediaRepository>,
        failing: BTreeSet<String>,
    ) -> Dispatcher {
        let mut settings = Settings::default();
        settings.embed.max_rps = 1000;
        settings.sanitize.max_rps = 1000;
        let registry = build_registry(
            &settings,
            WorkerDeps {
                media,
                jobs: h.jobs.clone(),
                checkpoints: h.checkpoints.clone(),
                embedder: Arc::new(FakeEmbedder { failing }),
                rewriter: Arc::new(FakeRewriter),
            },
        );
        h.dispatcher(registry, 3)
    }

    #[tokio::test]
    async fn embedding_backfill_tolerates_partial_failure() {
        let h = Harness::new();
        let media = media_with(1..=10);
        let dispatcher = domain_dispatcher(&h, media.clone(), [url(3), url(7)].into_iter().collect());
        let job_id = h.enqueue_backfill().await;

        assert_eq!(dispatcher.dispatch_once().await.unwrap().succeeded, 1);

        for id in 1..=10 {
            let stored = media.embedding(ItemId::new(id)).unwrap().is_some();
            assert_eq!(stored, id != 3 && id != 7, "item {id}");
        }

        let runs = h.service.list_recent_runs(RunQuery::default()).await.unwrap();
        let metrics = runs[0].metrics.unwrap();
        assert_eq!((metrics.processed, metrics.updated, metrics.failed), (10, 8, 2));

        match h.service.get_job_status(job_id).await {
            JobStatusOutcome::Found(view) => {
                assert_eq!(view.status, JobStatus::Done);
                assert!(view.step.unwrap().contains("2 failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_sanitize_records_assets() {
        let h = Harness::new();
        let media = media_with([4, 2, 9]);
        let dispatcher = domain_dispatcher(&h, media.clone(), BTreeSet::new());
        let job_id = h
            .service
            .enqueue_job("acme", JobPayload::ImageSanitize { max_items: Some(2) })
            .await
            .unwrap();

        dispatcher.dispatch_once().await.unwrap();

        assert!(media.sanitized_url(ItemId::new(2)).unwrap().is_some());
        assert!(media.sanitized_url(ItemId::new(4)).unwrap().is_some());
        assert!(media.sanitized_url(ItemId::new(9)).unwrap().is_none());

        let JobStatusOutcome::Found(view) = h.service.get_job_status(job_id).await else {
            panic!("job missing");
        };
        assert_eq!(view.status, JobStatus::Done);
        let items: Vec<i64> = view.assets.iter().map(|a| a.item_id.get()).collect();
        assert_eq!(items.len(), 2);
        assert!(items.contains(&2) && items.contains(&4));
        assert!(view.assets.iter().all(|a| a.kind == SANITIZED_ASSET_KIND));
        assert!(view.assets[0].url.contains("/acme/"));
    }

    #[tokio::test]
    async fn run_once_is_routed_through_registry() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(WorkerRegistry::new().with(Arc::new(EchoHandler)), 1);
        let job_id = h
            .service
            .enqueue_job("ops", JobPayload::RunOnce { echo: "ping".into() })
            .await
            .unwrap();

        dispatcher.dispatch_once().await.unwrap();
        assert_eq!(h.job(job_id).await.status, JobStatus::Done);
        assert_eq!(h.service.list_recent_jobs(None).await.unwrap().len(), 1);
    }

    // ---------- checkpoint monotonicity ----------

    /// Records every cursor written through it.
    #[derive(Default)]
    struct RecordingCheckpoints {
        inner: InMemoryCheckpointStore,
        written: Mutex<Vec<(RunId, Cursor)>>,
    }

    #[async_trait]
    impl CheckpointStore for RecordingCheckpoints {
        async fn get(&self, run_id: RunId) -> Result<Option<Cursor>, StoreError> {
            self.inner.get(run_id).await
        }

        async fn set(&self, run_id: RunId, cursor: Cursor) -> Result<(), StoreError> {
            self.written.lock().unwrap().push((run_id, cursor));
            self.inner.set(run_id, cursor).await
        }

        async fn purge(&self, run_id: RunId) -> Result<(), StoreError> {
            self.inner.purge(run_id).await
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn checkpoints_never_move_backwards(
            n in 0i64..60,
            chunk in 1usize..12,
            failing in proptest::collection::btree_set(1i64..60, 0..20),
            crash_at in proptest::option::of(0i64..60),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let written = rt.block_on(async {
                let jobs = InMemoryJobStore::arc();
                let runs = InMemoryRunStore::arc();
                let checkpoints = Arc::new(RecordingCheckpoints::default());

                let mut worker = Sequence::new(n);
                worker.failing = failing;
                *worker.crash_after.lock().unwrap() = crash_at;
                let driver = RunDriver::new(
                    JobType::EmbeddingBackfill,
                    Arc::new(worker),
                    BoundedExecutor::new(3),
                    checkpoints.clone(),
                )
                .with_chunk_size(chunk);

                let dispatcher = Dispatcher::new(
                    jobs.clone(),
                    runs,
                    checkpoints.clone(),
                    WorkerRegistry::new().with(Arc::new(driver)),
                    DispatcherConfig::default()
                        .with_max_attempts(4)
                        .with_retry_policy(RetryPolicy::immediate()),
                );
                let job = Job::new("acme", JobPayload::EmbeddingBackfill { max_items: None }).unwrap();
                jobs.insert(&job).await.unwrap();
                for _ in 0..4 {
                    dispatcher.dispatch_once().await.unwrap();
                }
                let written = checkpoints.written.lock().unwrap().clone();
                written
            });

            // a successor's first write is the carried-over cursor
            let mut last: BTreeMap<RunId, Cursor> = BTreeMap::new();
            for (run_id, cursor) in written {
                if let Some(prev) = last.get(&run_id) {
                    prop_assert!(cursor > *prev, "cursor moved from {} to {}", prev, cursor);
                }
                last.insert(run_id, cursor);
            }
        }
    }
}
