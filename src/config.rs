use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};

/// How the leader turns a total limit into per-member limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlerMode {
    /// Every member gets `total / member_count`.
    Uniform,
    /// Max-min fair share of the total based on reported usage, plus headroom.
    #[default]
    Adaptive,
    /// Every throttle request is admitted by the leader itself.
    Precise,
}

impl fmt::Display for ThrottlerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottlerMode::Uniform => f.write_str("uniform"),
            ThrottlerMode::Adaptive => f.write_str("adaptive"),
            ThrottlerMode::Precise => f.write_str("precise"),
        }
    }
}

/// Configuration of one local token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ThroughputThrottlerConfig {
    /// Units per second; `None` means unlimited.
    #[validate(range(min = 0.0))]
    pub limit: Option<f64>,
    /// Bucket capacity is `limit * period`.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub period: Duration,
}

impl Default for ThroughputThrottlerConfig {
    fn default() -> Self {
        Self {
            limit: None,
            period: Duration::from_secs(1),
        }
    }
}

impl ThroughputThrottlerConfig {
    pub fn with_limit(limit: f64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct MemberClientConfig {
    /// How often the member refreshes its registration.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub heartbeat_period: Duration,
    /// A member not refreshed within this interval is considered gone.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub lease_timeout: Duration,
}

impl Default for MemberClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryClientConfig {
    /// Namespace for every key the discovery layer writes.
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub read_timeout: Duration,
}

impl Default for DiscoveryClientConfig {
    fn default() -> Self {
        Self {
            key_prefix: "distributed_throttler".to_string(),
            read_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedThrottlerConfig {
    pub mode: ThrottlerMode,

    /// Timeout of follower-to-leader heartbeats.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub control_rpc_timeout: Duration,

    /// Default timeout of forwarded throttle requests in precise mode.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub throttle_rpc_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub limit_update_period: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub leader_update_period: Duration,

    /// Throttlers nobody reported for this long are forgotten by the leader.
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "positive_duration"))]
    pub throttler_expiration_time: Duration,

    /// Share of the total limit handed out on top of observed usage.
    #[validate(range(min = 0.0))]
    pub extra_limit_ratio: f64,

    /// Decay speed of the usage estimate, in halvings per second.
    #[validate(range(min = 0.0))]
    pub ema_alpha: f64,

    #[validate(range(min = 1, max = 1024))]
    pub shard_count: usize,

    #[validate(nested)]
    pub member_client: MemberClientConfig,

    #[validate(nested)]
    pub discovery_client: DiscoveryClientConfig,
}

impl Default for DistributedThrottlerConfig {
    fn default() -> Self {
        Self {
            mode: ThrottlerMode::Adaptive,
            control_rpc_timeout: Duration::from_secs(5),
            throttle_rpc_timeout: Duration::from_secs(5),
            limit_update_period: Duration::from_secs(1),
            leader_update_period: Duration::from_secs(5),
            throttler_expiration_time: Duration::from_secs(30),
            extra_limit_ratio: 0.1,
            ema_alpha: 2.0,
            shard_count: 16,
            member_client: MemberClientConfig::default(),
            discovery_client: DiscoveryClientConfig::default(),
        }
    }
}

/// Limits applied by the RPC layer to the `Throttle` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct RpcServerConfig {
    #[validate(range(min = 1))]
    pub throttle_concurrency_limit: usize,
    pub throttle_queue_size_limit: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            throttle_concurrency_limit: 10_000,
            throttle_queue_size_limit: 20_000,
        }
    }
}

/// Everything a node process needs to join a throttling group.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Local address the RPC server listens on.
    pub bind_addr: SocketAddr,
    /// Address other members use to reach this node; defaults to `bind_addr`.
    pub advertised_address: Option<String>,
    #[validate(length(min = 1))]
    pub redis_url: String,
    #[validate(length(min = 1))]
    pub group_id: String,
    /// Generated when absent.
    pub member_id: Option<String>,
    pub log_level: String,
    #[validate(nested)]
    pub distributed: DistributedThrottlerConfig,
    #[validate(nested)]
    pub rpc: RpcServerConfig,
    /// Throttlers declared by this node at startup.
    pub throttlers: HashMap<String, ThroughputThrottlerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9013)),
            advertised_address: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            group_id: "default".to_string(),
            member_id: None,
            log_level: "info".to_string(),
            distributed: DistributedThrottlerConfig::default(),
            rpc: RpcServerConfig::default(),
            throttlers: HashMap::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn advertised_address(&self) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| self.bind_addr.to_string())
    }

    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        for throttler in self.throttlers.values() {
            throttler.validate()?;
        }
        Ok(())
    }
}

fn positive_duration(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DistributedThrottlerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, ThrottlerMode::Adaptive);
        assert_eq!(config.shard_count, 16);
        assert!(NodeConfig::default().validate_all().is_ok());
    }

    #[test]
    fn test_humantime_durations() {
        let config: DistributedThrottlerConfig = serde_json::from_str(
            r#"{"mode": "precise", "limit_update_period": "250ms", "throttler_expiration_time": "2m"}"#,
        )
        .unwrap();
        assert_eq!(config.mode, ThrottlerMode::Precise);
        assert_eq!(config.limit_update_period, Duration::from_millis(250));
        assert_eq!(config.throttler_expiration_time, Duration::from_secs(120));
        assert_eq!(config.leader_update_period, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = DistributedThrottlerConfig {
            extra_limit_ratio: -0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DistributedThrottlerConfig {
            limit_update_period: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let throttler = ThroughputThrottlerConfig {
            limit: Some(-1.0),
            ..Default::default()
        };
        assert!(throttler.validate().is_err());
    }

    #[test]
    fn test_node_config_from_json() {
        let config = NodeConfig::from_json(
            r#"{
                "bind_addr": "0.0.0.0:9100",
                "advertised_address": "node-1:9100",
                "group_id": "uploads",
                "distributed": {"mode": "uniform"},
                "throttlers": {"bytes": {"limit": 1000.0, "period": "2s"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.advertised_address(), "node-1:9100");
        assert_eq!(config.distributed.mode, ThrottlerMode::Uniform);
        assert_eq!(config.throttlers["bytes"].period, Duration::from_secs(2));
        assert!(config.validate_all().is_ok());

        assert!(NodeConfig::from_json(r#"{"unknown": 1}"#).is_err());
    }
}
