//! Throughput benchmarks for the limiter and executor.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mediarun_batch::{BatchItem, BoundedExecutor, ItemError, TokenBucket};
use mediarun_core::ItemId;

struct Noop(i64);

impl BatchItem for Noop {
    fn item_id(&self) -> ItemId {
        ItemId::new(self.0)
    }
}

fn bench_try_acquire(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let _guard = runtime.enter();
    let bucket = TokenBucket::new(u32::MAX);

    c.bench_function("token_bucket_try_acquire", |b| {
        b.iter(|| black_box(bucket.try_acquire()))
    });
}

fn bench_executor(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_time()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("bounded_executor_noop_items");
    for concurrency in [1usize, 8, 32] {
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                let limiter = Arc::new(TokenBucket::new(u32::MAX));
                b.iter(|| {
                    let executor = BoundedExecutor::new(concurrency).with_limiter(limiter.clone());
                    let items: Vec<Noop> = (0..500).map(Noop).collect();
                    runtime.block_on(executor.run(items, |_item: Noop| async { Ok::<(), ItemError>(()) }))
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_try_acquire, bench_executor);
criterion_main!(benches);
