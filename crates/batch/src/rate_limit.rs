//! Fixed-window token bucket.
//!
//! Once per window the token count resets to capacity. This permits a burst of
//! up to 2x capacity straddling a window boundary; callers needing strict
//! smoothing need a leaky bucket instead. Limits are per process: separate
//! instances (or processes) are never coordinated.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Default sleep between attempts while a caller waits for a token.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    tokens: u32,
    started: Instant,
}

/// Shared request-rate ceiling ("N tokens per second").
///
/// Share one instance (behind an `Arc`) across every task that calls the
/// same downstream service.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    poll_interval: Duration,
    window: Mutex<Window>,
}

impl TokenBucket {
    /// Create a bucket allowing `per_second` acquisitions per window.
    ///
    /// A rate of zero is clamped to one.
    pub fn new(per_second: u32) -> Self {
        let capacity = per_second.max(1);
        Self {
            capacity,
            poll_interval: DEFAULT_POLL_INTERVAL,
            window: Mutex::new(Window {
                tokens: capacity,
                started: Instant::now(),
            }),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take a token if one is available in the current window.
    pub fn try_acquire(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if now.duration_since(window.started) >= WINDOW {
            window.tokens = self.capacity;
            // Keep window boundaries on a stable cadence even if nobody
            // acquired for a while.
            while window.started + WINDOW <= now {
                window.started += WINDOW;
            }
        }

        if window.tokens == 0 {
            return false;
        }
        window.tokens -= 1;
        true
    }

    /// Wait until a token is available, then consume exactly one.
    pub async fn acquire(&self) {
        while !self.try_acquire() {
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
