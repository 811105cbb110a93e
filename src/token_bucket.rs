use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::time::{self, Duration, Instant};

use crate::config::ThroughputThrottlerConfig;

/// Local throughput throttler.
///
/// Tokens refill at `limit` units per second up to `limit * period`. Requests
/// passing through [`TokenBucket::throttle`] are admitted while the bucket is
/// not in debt and may push it below zero; later requests wait until the debt
/// is repaid. `limit = None` disables throttling altogether.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    queue_total_count: AtomicI64,
}

#[derive(Debug)]
struct BucketState {
    limit: Option<f64>,
    period: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn capacity(&self) -> Option<f64> {
        self.limit.map(|limit| limit * self.period.as_secs_f64())
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;

        if let (Some(limit), Some(capacity)) = (self.limit, self.capacity()) {
            self.tokens = (self.tokens + limit * elapsed.as_secs_f64()).min(capacity);
        }
    }

    fn apply(&mut self, limit: Option<f64>, period: Duration) {
        self.refill(Instant::now());

        let was_unlimited = self.limit.is_none();
        self.limit = limit;
        self.period = period;

        match self.capacity() {
            Some(capacity) if was_unlimited => self.tokens = capacity,
            Some(capacity) => self.tokens = self.tokens.min(capacity),
            None => self.tokens = 0.0,
        }
    }

    /// Time until the bucket leaves debt, bounded by one period so that limit
    /// changes are observed by waiters.
    fn time_until_solvent(&self, limit: f64) -> Duration {
        if limit <= 0.0 {
            return self.period;
        }
        let deficit = (-self.tokens).max(0.0);
        let wait = Duration::from_secs_f64(deficit / limit) + Duration::from_millis(1);
        wait.min(self.period)
    }
}

/// Accounts a waiting request in the queue counter until dropped.
struct QueueGuard<'a> {
    counter: &'a AtomicI64,
    count: i64,
}

impl<'a> QueueGuard<'a> {
    fn enter(counter: &'a AtomicI64, count: i64) -> Self {
        counter.fetch_add(count, Ordering::Relaxed);
        Self { counter, count }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.count, Ordering::Relaxed);
    }
}

impl TokenBucket {
    pub fn new(config: &ThroughputThrottlerConfig) -> Self {
        let mut state = BucketState {
            limit: None,
            period: config.period,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        state.apply(config.limit, config.period);

        Self {
            state: Mutex::new(state),
            queue_total_count: AtomicI64::new(0),
        }
    }

    /// Wait until `count` units are admitted.
    ///
    /// Cancel-safe: dropping the future before completion consumes nothing.
    pub async fn throttle(&self, count: i64) {
        if count <= 0 {
            return;
        }

        let mut queued = None;
        loop {
            let wait = {
                let mut state = self.state.lock();
                state.refill(Instant::now());
                match state.limit {
                    None => return,
                    Some(_) if state.tokens > 0.0 => {
                        state.tokens -= count as f64;
                        return;
                    }
                    Some(limit) => state.time_until_solvent(limit),
                }
            };

            if queued.is_none() {
                queued = Some(QueueGuard::enter(&self.queue_total_count, count));
            }
            time::sleep(wait).await;
        }
    }

    pub fn try_acquire(&self, count: i64) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now());

        if state.limit.is_none() {
            return true;
        }
        if self.queue_total_count.load(Ordering::Relaxed) == 0 && state.tokens >= count as f64 {
            state.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    /// Acquire as many of `count` units as are currently available.
    pub fn try_acquire_available(&self, count: i64) -> i64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());

        if state.limit.is_none() {
            return count;
        }
        if self.queue_total_count.load(Ordering::Relaxed) > 0 {
            return 0;
        }
        let acquired = count.min(state.tokens.floor().max(0.0) as i64);
        state.tokens -= acquired as f64;
        acquired
    }

    /// Consume `count` units unconditionally, possibly going into debt.
    pub fn acquire(&self, count: i64) {
        let mut state = self.state.lock();
        state.refill(Instant::now());

        if state.limit.is_some() {
            state.tokens -= count as f64;
        }
    }

    pub fn is_overdraft(&self) -> bool {
        if self.queue_total_count.load(Ordering::Relaxed) > 0 {
            return true;
        }
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.limit.is_some() && state.tokens < 0.0
    }

    pub fn queue_total_count(&self) -> i64 {
        self.queue_total_count.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: Option<f64>) {
        let mut state = self.state.lock();
        let period = state.period;
        state.apply(limit, period);
    }

    pub fn reconfigure(&self, config: &ThroughputThrottlerConfig) {
        self.state.lock().apply(config.limit, config.period);
    }

    pub fn limit(&self) -> Option<f64> {
        self.state.lock().limit
    }

    pub fn period(&self) -> Duration {
        self.state.lock().period
    }

    /// Tokens left in the bucket; negative while in debt.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }
}
