use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DistributedThrottlerConfig, ThrottlerMode, ThroughputThrottlerConfig};
use crate::error::{Error, Result};
use crate::messages::ThrottleRequest;
use crate::proxy::{DistributedThrottlerProxy, LeaderChannel};
use crate::token_bucket::TokenBucket;
use crate::usage::UsageAggregator;
use crate::validation::validate_count;

/// Capabilities shared by local and distributed throttlers.
#[async_trait]
pub trait ThroughputThrottler: Send + Sync {
    /// Wait until `count` units are admitted.
    async fn throttle(&self, count: i64) -> Result<()>;

    /// Admit `count` units if they are available right now.
    fn try_acquire(&self, count: i64) -> Result<bool>;

    /// Admit up to `count` units, returning how many were taken.
    fn try_acquire_available(&self, count: i64) -> Result<i64>;

    /// Admit `count` units unconditionally.
    fn acquire(&self, count: i64) -> Result<()>;

    fn is_overdraft(&self) -> Result<bool>;

    fn queue_total_count(&self) -> Result<i64>;
}

pub trait ReconfigurableThroughputThrottler: ThroughputThrottler {
    fn reconfigure(&self, config: ThroughputThrottlerConfig);

    fn set_limit(&self, limit: Option<f64>);
}

#[async_trait]
impl ThroughputThrottler for TokenBucket {
    async fn throttle(&self, count: i64) -> Result<()> {
        validate_count(count)?;
        TokenBucket::throttle(self, count).await;
        Ok(())
    }

    fn try_acquire(&self, count: i64) -> Result<bool> {
        validate_count(count)?;
        Ok(TokenBucket::try_acquire(self, count))
    }

    fn try_acquire_available(&self, count: i64) -> Result<i64> {
        validate_count(count)?;
        Ok(TokenBucket::try_acquire_available(self, count))
    }

    fn acquire(&self, count: i64) -> Result<()> {
        validate_count(count)?;
        TokenBucket::acquire(self, count);
        Ok(())
    }

    fn is_overdraft(&self) -> Result<bool> {
        Ok(TokenBucket::is_overdraft(self))
    }

    fn queue_total_count(&self) -> Result<i64> {
        Ok(TokenBucket::queue_total_count(self))
    }
}

impl ReconfigurableThroughputThrottler for TokenBucket {
    fn reconfigure(&self, config: ThroughputThrottlerConfig) {
        TokenBucket::reconfigure(self, &config);
    }

    fn set_limit(&self, limit: Option<f64>) {
        TokenBucket::set_limit(self, limit);
    }
}

/// Throttler handed out by the factory.
///
/// Wraps a local bucket whose limit is periodically replaced by the leader's
/// allocation, and keeps a usage estimate the leader allocates from. In
/// precise mode every `throttle` call is forwarded to the leader instead.
#[derive(Debug)]
pub struct WrappedThrottler {
    throttler_id: String,
    underlying: TokenBucket,
    config: RwLock<Arc<DistributedThrottlerConfig>>,
    throttler_config: RwLock<ThroughputThrottlerConfig>,
    throttle_rpc_timeout: Duration,
    leader_channel: RwLock<Option<LeaderChannel>>,
    usage: UsageAggregator,
}

impl WrappedThrottler {
    pub fn new(
        throttler_id: String,
        config: Arc<DistributedThrottlerConfig>,
        throttler_config: ThroughputThrottlerConfig,
        throttle_rpc_timeout: Duration,
    ) -> Self {
        Self {
            underlying: TokenBucket::new(&throttler_config),
            usage: UsageAggregator::new(config.ema_alpha),
            throttler_id,
            config: RwLock::new(config),
            throttler_config: RwLock::new(throttler_config),
            throttle_rpc_timeout,
            leader_channel: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.throttler_id
    }

    pub fn mode(&self) -> ThrottlerMode {
        self.config.read().mode
    }

    pub fn set_distributed_config(&self, config: Arc<DistributedThrottlerConfig>) {
        self.usage.set_alpha(config.ema_alpha);
        *self.config.write() = config;
    }

    pub fn usage_rate(&self) -> f64 {
        self.usage.rate()
    }

    /// Configuration declared by the application; `limit` is the total for the whole group.
    pub fn config(&self) -> ThroughputThrottlerConfig {
        self.throttler_config.read().clone()
    }

    /// Limit currently enforced by the local bucket.
    pub fn current_limit(&self) -> Option<f64> {
        self.underlying.limit()
    }

    pub fn set_leader_channel(&self, channel: Option<LeaderChannel>) {
        *self.leader_channel.write() = channel;
    }

    pub fn leader_channel(&self) -> Option<LeaderChannel> {
        self.leader_channel.read().clone()
    }

    fn ensure_not_precise(&self, method: &str) -> Result<()> {
        let mode = self.mode();
        if mode == ThrottlerMode::Precise {
            return Err(Error::unexpected_mode(method, mode));
        }
        Ok(())
    }
}

#[async_trait]
impl ThroughputThrottler for WrappedThrottler {
    async fn throttle(&self, count: i64) -> Result<()> {
        validate_count(count)?;
        if self.mode() == ThrottlerMode::Precise {
            // Either we are the leader or the leader is not known yet.
            let Some(channel) = self.leader_channel() else {
                self.underlying.throttle(count).await;
                return Ok(());
            };

            let request = ThrottleRequest {
                throttler_id: self.throttler_id.clone(),
                count,
            };
            return DistributedThrottlerProxy::new(channel)
                .throttle(&request, self.throttle_rpc_timeout)
                .await;
        }

        self.underlying.throttle(count).await;
        self.usage.update(count);
        Ok(())
    }

    fn try_acquire(&self, count: i64) -> Result<bool> {
        self.ensure_not_precise("try_acquire")?;
        validate_count(count)?;

        let acquired = self.underlying.try_acquire(count);
        if acquired {
            self.usage.update(count);
        }
        Ok(acquired)
    }

    fn try_acquire_available(&self, count: i64) -> Result<i64> {
        self.ensure_not_precise("try_acquire_available")?;
        validate_count(count)?;

        let acquired = self.underlying.try_acquire_available(count);
        if acquired > 0 {
            self.usage.update(acquired);
        }
        Ok(acquired)
    }

    fn acquire(&self, count: i64) -> Result<()> {
        self.ensure_not_precise("acquire")?;
        validate_count(count)?;

        self.usage.update(count);
        self.underlying.acquire(count);
        Ok(())
    }

    fn is_overdraft(&self) -> Result<bool> {
        self.ensure_not_precise("is_overdraft")?;
        Ok(self.underlying.is_overdraft())
    }

    fn queue_total_count(&self) -> Result<i64> {
        self.ensure_not_precise("queue_total_count")?;
        Ok(self.underlying.queue_total_count())
    }
}

impl ReconfigurableThroughputThrottler for WrappedThrottler {
    /// In precise mode the local bucket is the leader's enforcement bucket and
    /// takes the new configuration at once; otherwise the configuration waits
    /// for the next limit pushed by the leader.
    fn reconfigure(&self, config: ThroughputThrottlerConfig) {
        if self.mode() == ThrottlerMode::Precise {
            self.underlying.reconfigure(&config);
        }
        *self.throttler_config.write() = config;
    }

    fn set_limit(&self, limit: Option<f64>) {
        let mut config = self.throttler_config.read().clone();
        config.limit = limit;
        self.underlying.reconfigure(&config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn wrapped(mode: ThrottlerMode, limit: Option<f64>) -> WrappedThrottler {
        let config = Arc::new(DistributedThrottlerConfig {
            mode,
            ..Default::default()
        });
        let throttler_config = ThroughputThrottlerConfig {
            limit,
            ..Default::default()
        };
        WrappedThrottler::new("uploads".to_string(), config, throttler_config, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_recorded_on_success() {
        let throttler = wrapped(ThrottlerMode::Adaptive, Some(10.0));
        assert_eq!(throttler.usage_rate(), 0.0);

        assert!(assert_ok!(throttler.try_acquire(4)));
        assert_eq!(throttler.usage_rate(), 4.0);

        assert!(!assert_ok!(throttler.try_acquire(100)));
        assert_eq!(throttler.usage_rate(), 4.0);

        assert_ok!(throttler.throttle(2).await);
        assert_eq!(throttler.usage_rate(), 6.0);

        assert_eq!(assert_ok!(throttler.try_acquire_available(100)), 4);
        assert_eq!(throttler.usage_rate(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_counts_rejected() {
        let throttler = wrapped(ThrottlerMode::Adaptive, Some(10.0));

        let err = assert_err!(throttler.try_acquire(-1000));
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
        assert_err!(throttler.try_acquire_available(-1));
        assert_err!(throttler.acquire(-1));
        assert_err!(throttler.throttle(-1).await);
        assert_eq!(throttler.usage_rate(), 0.0);
        assert!(!assert_ok!(throttler.is_overdraft()));

        let heartbeat = crate::messages::HeartbeatRequest {
            member_id: "m-1".to_string(),
            throttlers: vec![crate::messages::ThrottlerUsage {
                id: throttler.id().to_string(),
                usage_rate: throttler.usage_rate(),
            }],
        };
        assert_ok!(crate::validation::validate_heartbeat(&heartbeat));

        let precise = wrapped(ThrottlerMode::Precise, Some(10.0));
        let err = assert_err!(precise.throttle(-1).await);
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precise_mode_rejects_local_admission() {
        let throttler = wrapped(ThrottlerMode::Precise, Some(10.0));

        let err = assert_err!(throttler.try_acquire(1));
        assert_eq!(err.code(), crate::error::ErrorCode::UnexpectedThrottlerMode);
        assert_err!(throttler.try_acquire_available(1));
        assert_err!(throttler.acquire(1));
        assert_err!(throttler.is_overdraft());
        assert_err!(throttler.queue_total_count());

        // Without a leader channel precise throttling is served locally.
        assert_ok!(throttler.throttle(5).await);
        assert_eq!(throttler.usage_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_waits_for_leader_limit() {
        let throttler = wrapped(ThrottlerMode::Adaptive, Some(100.0));

        throttler.reconfigure(ThroughputThrottlerConfig {
            limit: Some(500.0),
            period: Duration::from_secs(2),
        });
        assert_eq!(throttler.current_limit(), Some(100.0));
        assert_eq!(throttler.config().limit, Some(500.0));

        throttler.set_limit(Some(40.0));
        assert_eq!(throttler.current_limit(), Some(40.0));
        assert_eq!(throttler.underlying.period(), Duration::from_secs(2));
        assert_eq!(throttler.config().limit, Some(500.0));

        throttler.set_limit(None);
        assert_eq!(throttler.current_limit(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precise_reconfigure_applies_immediately() {
        let throttler = wrapped(ThrottlerMode::Precise, Some(100.0));
        throttler.reconfigure(ThroughputThrottlerConfig::with_limit(7.0));
        assert_eq!(throttler.current_limit(), Some(7.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_switch_keeps_usage_history() {
        let throttler = wrapped(ThrottlerMode::Adaptive, None);
        assert_ok!(throttler.acquire(12));

        throttler.set_distributed_config(Arc::new(DistributedThrottlerConfig {
            mode: ThrottlerMode::Uniform,
            ema_alpha: 0.5,
            ..Default::default()
        }));
        assert_eq!(throttler.mode(), ThrottlerMode::Uniform);
        assert_eq!(throttler.usage_rate(), 12.0);
    }
}
