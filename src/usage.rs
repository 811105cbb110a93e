//! Smoothed estimate of how fast a throttler is being consumed.

use parking_lot::Mutex;
use tokio::time::Instant;

/// Exponential moving average of consumed units.
///
/// On every update the previous estimate decays by `2^(-alpha * dt)` (with
/// `dt` in seconds) before the new amount is added. The first update seeds
/// the estimate with the amount itself.
#[derive(Debug)]
pub struct UsageAggregator {
    state: Mutex<AggregatorState>,
}

#[derive(Debug)]
struct AggregatorState {
    alpha: f64,
    rate: f64,
    last_update: Option<Instant>,
}

impl UsageAggregator {
    pub fn new(alpha: f64) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                alpha,
                rate: 0.0,
                last_update: None,
            }),
        }
    }

    /// Change the decay speed; accumulated history is kept.
    pub fn set_alpha(&self, alpha: f64) {
        self.state.lock().alpha = alpha;
    }

    pub fn update(&self, count: i64) {
        self.update_at(Instant::now(), count);
    }

    pub fn update_at(&self, now: Instant, count: i64) {
        let mut state = self.state.lock();
        let count = count as f64;

        match state.last_update {
            None => state.rate = count,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                let weight = (-state.alpha * elapsed).exp2();
                state.rate = state.rate * weight + count;
            }
        }

        // Out-of-order timestamps from concurrent callers must not move time back.
        if state.last_update.map_or(true, |last| now > last) {
            state.last_update = Some(now);
        }
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_update_seeds_rate() {
        let aggregator = UsageAggregator::new(2.0);
        assert_eq!(aggregator.rate(), 0.0);

        aggregator.update_at(Instant::now(), 40);
        assert_eq!(aggregator.rate(), 40.0);
    }

    #[test]
    fn test_previous_rate_decays() {
        let aggregator = UsageAggregator::new(2.0);
        let start = Instant::now();

        aggregator.update_at(start, 100);
        // Half a second at alpha 2 is exactly one halving.
        aggregator.update_at(start + Duration::from_millis(500), 10);
        assert!((aggregator.rate() - 60.0).abs() < 1e-9);

        aggregator.update_at(start + Duration::from_millis(500), 5);
        assert!((aggregator.rate() - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_change_keeps_history() {
        let aggregator = UsageAggregator::new(2.0);
        let start = Instant::now();
        aggregator.update_at(start, 80);

        aggregator.set_alpha(1.0);
        assert_eq!(aggregator.rate(), 80.0);

        aggregator.update_at(start + Duration::from_secs(1), 0);
        assert!((aggregator.rate() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_timestamp_does_not_rewind() {
        let aggregator = UsageAggregator::new(2.0);
        let start = Instant::now();
        aggregator.update_at(start + Duration::from_secs(1), 10);
        aggregator.update_at(start, 10);
        assert_eq!(aggregator.rate(), 20.0);
    }
}
