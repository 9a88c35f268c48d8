//! Bounded executor with rate limiting and partial-failure tolerance.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::rate_limit::TokenBucket;
use crate::report::{BatchReport, ItemResult};
use crate::worker::{BatchItem, ItemError};

/// Executor contract violations.
///
/// Remote-call failures never surface here; they are item outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("item task was lost: {0}")]
    TaskLost(String),
}

/// Runs one async operation per item with at most `concurrency` in flight.
///
/// Each operation waits for a rate-limiter token (when configured) before it
/// starts its remote call. Every item is attempted exactly once; there is no
/// per-item retry here.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    name: String,
    concurrency: usize,
    limiter: Option<Arc<TokenBucket>>,
    call_timeout: Option<Duration>,
}

impl BoundedExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            name: "batch".to_string(),
            concurrency,
            limiter: None,
            call_timeout: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Per-item deadline; an item exceeding it counts as failed.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Apply `op` to every item and wait for all of them to finish.
    ///
    /// Returns only once every item has a terminal outcome. A failing or
    /// panicking item never cancels its siblings.
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, op: F) -> Result<BatchReport, ExecutorError>
    where
        T: BatchItem,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ItemError>> + Send + 'static,
    {
        if self.concurrency == 0 {
            return Err(ExecutorError::ZeroConcurrency);
        }

        let total = items.len();
        debug!(executor = %self.name, items = total, concurrency = self.concurrency, "starting batch");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();

        let mut spawned = HashMap::with_capacity(total);
        for item in items {
            // The permit is taken before spawning, so at most `concurrency`
            // item tasks exist at any instant.
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ExecutorError::TaskLost(e.to_string()))?;

            let op = op.clone();
            let limiter = self.limiter.clone();
            let call_timeout = self.call_timeout;
            let item_id = item.item_id();
            *spawned.entry(item_id).or_insert(0usize) += 1;

            tasks.spawn(async move {
                let _permit = permit;
                if let Some(limiter) = limiter {
                    limiter.acquire().await;
                }
                // op(item) itself runs inside the guard: a panic while
                // building the future is an item failure too
                let result = run_guarded(async move { op(item).await }, call_timeout).await;
                (item_id, result)
            });
        }

        let mut results = Vec::with_capacity(total);
        let mut lost = None;
        while let Some(joined) = tasks.join_next().await {
            let (item_id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(executor = %self.name, error = %e, "item task lost");
                    lost = Some(e.to_string());
                    continue;
                }
            };
            if let Some(n) = spawned.get_mut(&item_id) {
                *n -= 1;
            }
            match result {
                Ok(()) => results.push(ItemResult::updated(item_id)),
                Err(err) => {
                    warn!(executor = %self.name, item_id = %item_id, error = %err, "item failed");
                    results.push(ItemResult::failed(item_id, err.to_string()));
                }
            }
        }

        // a task that never reported is a failed item, not a failed batch
        if let Some(reason) = lost {
            for (item_id, missing) in spawned {
                for _ in 0..missing {
                    results.push(ItemResult::failed(item_id, format!("item task was lost: {reason}")));
                }
            }
        }

        let report = BatchReport::from_results(results);
        debug!(
            executor = %self.name,
            processed = report.processed,
            updated = report.updated,
            failed = report.failed,
            "batch finished"
        );
        Ok(report)
    }
}

async fn run_guarded<Fut>(call: Fut, timeout: Option<Duration>) -> Result<(), ItemError>
where
    Fut: Future<Output = Result<(), ItemError>> + Send,
{
    let call = AssertUnwindSafe(call).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(ItemError::Timeout(limit)),
        },
        None => call.await,
    };
    outcome.unwrap_or_else(|panic| Err(ItemError::Panicked(panic_message(&*panic))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
