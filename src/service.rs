//! Leader-side state of a throttling group.
//!
//! Every member owns a [`DistributedThrottlerService`], but only the leader
//! keeps it initialized: registered with the RPC server and recomputing
//! per-member limits every `limit_update_period`.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::algorithms::{adaptive_limits, uniform_limit};
use crate::config::{DistributedThrottlerConfig, ThrottlerMode};
use crate::discovery::DiscoveryClient;
use crate::error::{Error, Result};
use crate::messages::{HeartbeatRequest, HeartbeatResponse, ThrottlerLimit};
use crate::periodic::{BoxFuture, Callback, PeriodicExecutor};
use crate::registry::ThrottlerRegistry;
use crate::server::RpcServer;
use crate::throttler::{ThroughputThrottler, WrappedThrottler};

#[derive(Debug)]
struct MemberUsage {
    rates: HashMap<String, f64>,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct MemberShard {
    limits: RwLock<HashMap<String, HashMap<String, f64>>>,
    usage_rates: RwLock<HashMap<String, MemberUsage>>,
}

#[derive(Debug, Default)]
struct ThrottlerShard {
    total_limits: RwLock<HashMap<String, Option<f64>>>,
    uniform_limits: RwLock<HashMap<String, f64>>,
    last_update: RwLock<HashMap<String, Instant>>,
}

pub struct DistributedThrottlerService {
    discovery: Arc<dyn DiscoveryClient>,
    group_id: String,
    realm_id: Uuid,
    registry: Arc<ThrottlerRegistry<WrappedThrottler>>,
    rpc_server: Arc<RpcServer>,
    config: RwLock<Arc<DistributedThrottlerConfig>>,
    member_shards: Vec<MemberShard>,
    throttler_shards: Vec<ThrottlerShard>,
    update_executor: PeriodicExecutor,
    initialized: AtomicBool,
}

impl DistributedThrottlerService {
    pub fn new(
        discovery: Arc<dyn DiscoveryClient>,
        group_id: String,
        realm_id: Uuid,
        registry: Arc<ThrottlerRegistry<WrappedThrottler>>,
        rpc_server: Arc<RpcServer>,
        config: Arc<DistributedThrottlerConfig>,
    ) -> Arc<Self> {
        let shard_count = config.shard_count.max(1);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let callback: Callback = Arc::new(move || -> BoxFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(service) = weak.upgrade() {
                        service.update_limits().await;
                    }
                })
            });

            Self {
                discovery,
                group_id,
                realm_id,
                registry,
                rpc_server,
                update_executor: PeriodicExecutor::new("leader_limit_update", config.limit_update_period, callback),
                config: RwLock::new(config),
                member_shards: (0..shard_count).map(|_| MemberShard::default()).collect(),
                throttler_shards: (0..shard_count).map(|_| ThrottlerShard::default()).collect(),
                initialized: AtomicBool::new(false),
            }
        })
    }

    pub fn realm_id(&self) -> Uuid {
        self.realm_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Arc<DistributedThrottlerConfig> {
        self.config.read().clone()
    }

    /// Start serving as leader. Returns `false` if already initialized.
    pub fn initialize(self: &Arc<Self>) -> bool {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.rpc_server.register_service(self.clone());
        self.update_executor.start();
        info!(group_id = %self.group_id, realm_id = %self.realm_id, "Distributed throttler service initialized");
        true
    }

    /// Stop serving as leader. Returns `false` if not initialized.
    pub async fn finalize(&self) -> bool {
        if self
            .initialized
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.update_executor.stop().await;
        self.rpc_server.unregister_service(self.realm_id);
        info!(group_id = %self.group_id, realm_id = %self.realm_id, "Distributed throttler service finalized");
        true
    }

    pub fn reconfigure(&self, config: Arc<DistributedThrottlerConfig>) {
        let old = self.config();
        if old.limit_update_period != config.limit_update_period {
            self.update_executor.set_period(config.limit_update_period);
        }
        *self.config.write() = config;
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.throttler_shards.len() as u64) as usize
    }

    fn throttler_shard(&self, throttler_id: &str) -> &ThrottlerShard {
        &self.throttler_shards[self.shard_index(throttler_id)]
    }

    fn member_shard(&self, member_id: &str) -> &MemberShard {
        &self.member_shards[self.shard_index(member_id)]
    }

    fn group_by_shard<'a, I>(&self, throttler_ids: I) -> Vec<Vec<&'a str>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut by_shard = vec![Vec::new(); self.throttler_shards.len()];
        for id in throttler_ids {
            by_shard[self.shard_index(id)].push(id);
        }
        by_shard
    }

    /// Record the group-wide limit of a throttler; `None` means unlimited.
    pub fn set_total_limit(&self, throttler_id: &str, limit: Option<f64>) {
        let shard = self.throttler_shard(throttler_id);
        shard.total_limits.write().insert(throttler_id.to_string(), limit);
        shard.last_update.write().insert(throttler_id.to_string(), Instant::now());
    }

    /// Replace everything known about the usage of `member_id`.
    pub fn update_usage_rate(&self, member_id: &str, rates: HashMap<String, f64>) {
        let now = Instant::now();

        let by_shard = self.group_by_shard(rates.keys().map(String::as_str));
        for (shard, ids) in self.throttler_shards.iter().zip(by_shard) {
            if ids.is_empty() {
                continue;
            }
            let mut last_update = shard.last_update.write();
            for id in ids {
                last_update.insert(id.to_string(), now);
            }
        }

        self.member_shard(member_id).usage_rates.write().insert(
            member_id.to_string(),
            MemberUsage {
                rates,
                updated_at: now,
            },
        );
    }

    /// Current limits of `member_id` for the given throttlers.
    ///
    /// Unlimited throttlers map to `None`. Throttlers without a computed
    /// limit are left out; the caller keeps whatever limit it had.
    pub fn get_member_limits<'a, I>(&self, member_id: &str, throttler_ids: I) -> HashMap<String, Option<f64>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mode = self.config.read().mode;
        let by_shard = self.group_by_shard(throttler_ids);

        let mut result = HashMap::new();
        for (shard, ids) in self.throttler_shards.iter().zip(by_shard) {
            if ids.is_empty() {
                continue;
            }

            {
                let total_limits = shard.total_limits.read();
                for id in &ids {
                    match total_limits.get(*id) {
                        None => warn!(throttler_id = %id, "There is no total limit for throttler"),
                        Some(None) => {
                            result.insert(id.to_string(), None);
                        }
                        Some(Some(_)) => {}
                    }
                }
            }

            let mut fill = |limits: Option<&HashMap<String, f64>>| {
                for id in &ids {
                    if result.contains_key(*id) {
                        continue;
                    }
                    match limits.and_then(|limits| limits.get(*id)) {
                        Some(limit) => {
                            result.insert(id.to_string(), Some(*limit));
                        }
                        None => warn!(member_id = %member_id, throttler_id = %id, "There is no limit for throttler"),
                    }
                }
            };

            if mode == ThrottlerMode::Uniform {
                let uniform_limits = shard.uniform_limits.read();
                fill(Some(&*uniform_limits));
            } else {
                let member_limits = self.member_shard(member_id).limits.read();
                fill(member_limits.get(member_id));
            }
        }
        result
    }

    /// `Heartbeat` RPC: reply with the limits computed from earlier reports,
    /// then store the reported usage.
    pub fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mode = self.config.read().mode;
        if mode == ThrottlerMode::Precise {
            return Err(Error::unexpected_mode("heartbeat", mode));
        }

        let rates: HashMap<String, f64> = request
            .throttlers
            .into_iter()
            .map(|usage| (usage.id, usage.usage_rate))
            .collect();

        let limits = self.get_member_limits(&request.member_id, rates.keys().map(String::as_str));
        let response = HeartbeatResponse {
            throttlers: limits
                .into_iter()
                .map(|(id, limit)| ThrottlerLimit { id, limit })
                .collect(),
        };

        debug!(member_id = %request.member_id, throttler_count = rates.len(), "Heartbeat received");
        self.update_usage_rate(&request.member_id, rates);
        Ok(response)
    }

    /// Leader throttler that serves `Throttle` calls for `throttler_id`.
    pub fn find_throttler(&self, throttler_id: &str) -> Result<Arc<WrappedThrottler>> {
        let mode = self.config.read().mode;
        if mode != ThrottlerMode::Precise {
            return Err(Error::unexpected_mode("throttle", mode));
        }

        self.registry
            .find(throttler_id)
            .ok_or_else(|| Error::NoSuchThrottler(throttler_id.to_string()))
    }

    /// `Throttle` RPC: admit `count` units through the leader's own throttler.
    pub async fn throttle(&self, throttler_id: &str, count: i64) -> Result<()> {
        let throttler = self.find_throttler(throttler_id)?;
        trace!(throttler_id = %throttler_id, count, "Throttling on behalf of a member");
        ThroughputThrottler::throttle(throttler.as_ref(), count).await
    }

    /// One iteration of the leader loop.
    pub async fn update_limits(&self) {
        self.forget_dead_throttlers(Instant::now());

        let config = self.config();
        match config.mode {
            ThrottlerMode::Precise => {}
            ThrottlerMode::Uniform => self.update_uniform_limit_distribution().await,
            ThrottlerMode::Adaptive => self.update_adaptive_limit_distribution(&config),
        }
    }

    pub async fn update_uniform_limit_distribution(&self) {
        let member_count = match self.discovery.get_group_meta(&self.group_id).await {
            Ok(meta) => meta.member_count,
            Err(e) => {
                warn!(group_id = %self.group_id, error = %e, "Error updating throttler limits");
                return;
            }
        };

        if member_count == 0 {
            warn!(group_id = %self.group_id, "No members in current group");
            return;
        }

        for shard in &self.throttler_shards {
            let uniform: HashMap<String, f64> = {
                let total_limits = shard.total_limits.read();
                total_limits
                    .iter()
                    .filter_map(|(id, total)| total.map(|total| (id.clone(), uniform_limit(total, member_count))))
                    .inspect(|(id, limit)| trace!(throttler_id = %id, limit, "Uniform distribution limit updated"))
                    .collect()
            };
            *shard.uniform_limits.write() = uniform;
        }
    }

    fn update_adaptive_limit_distribution(&self, config: &DistributedThrottlerConfig) {
        let mut new_limits: Vec<HashMap<String, HashMap<String, f64>>> =
            vec![HashMap::new(); self.member_shards.len()];

        for throttler_shard in &self.throttler_shards {
            let total_limits = throttler_shard.total_limits.read().clone();
            if total_limits.is_empty() {
                continue;
            }

            let mut usage_by_throttler: HashMap<&str, HashMap<String, f64>> = HashMap::new();
            let mut member_count = 0;
            for member_shard in &self.member_shards {
                let usage_rates = member_shard.usage_rates.read();
                member_count += usage_rates.len();
                for (member_id, usage) in usage_rates.iter() {
                    for id in total_limits.keys() {
                        match usage.rates.get(id) {
                            Some(rate) => {
                                usage_by_throttler
                                    .entry(id.as_str())
                                    .or_default()
                                    .insert(member_id.clone(), *rate);
                            }
                            None => debug!(member_id = %member_id, throttler_id = %id, "Member doesn't know about throttler"),
                        }
                    }
                }
            }

            for (id, usage_rates) in usage_by_throttler {
                let Some(Some(total_limit)) = total_limits.get(id).copied() else {
                    continue;
                };

                let allocation = adaptive_limits(total_limit, &usage_rates, member_count, config.extra_limit_ratio);
                for (member_id, limit) in allocation.limits {
                    trace!(
                        member_id = %member_id,
                        throttler_id = %id,
                        usage_rate = usage_rates[&member_id],
                        limit,
                        extra_limit = allocation.extra_limit,
                        "Updating throttler limit"
                    );
                    new_limits[self.shard_index(&member_id)]
                        .entry(member_id)
                        .or_default()
                        .insert(id.to_string(), limit);
                }
            }
        }

        for (shard, limits) in self.member_shards.iter().zip(new_limits) {
            *shard.limits.write() = limits;
        }
    }

    /// Drop throttlers nobody reported within `throttler_expiration_time`,
    /// along with members that stopped sending heartbeats.
    ///
    /// Locks are taken one at a time.
    pub fn forget_dead_throttlers(&self, now: Instant) {
        let expiration = self.config.read().throttler_expiration_time;
        let is_dead = |updated_at: Instant| now.saturating_duration_since(updated_at) > expiration;

        let mut dead: HashSet<String> = HashSet::new();
        for shard in &self.throttler_shards {
            let last_update = shard.last_update.read();
            dead.extend(
                last_update
                    .iter()
                    .filter(|(_, updated_at)| is_dead(**updated_at))
                    .map(|(id, _)| id.clone()),
            );
        }

        let mut dead_members: HashSet<String> = HashSet::new();
        for shard in &self.member_shards {
            let usage_rates = shard.usage_rates.read();
            dead_members.extend(
                usage_rates
                    .iter()
                    .filter(|(_, usage)| is_dead(usage.updated_at))
                    .map(|(id, _)| id.clone()),
            );
        }

        if dead.is_empty() && dead_members.is_empty() {
            return;
        }
        debug!(throttlers = ?dead, members = ?dead_members, "Forgetting dead throttlers");

        let dead_ids = self.group_by_shard(dead.iter().map(String::as_str));
        for (shard, ids) in self.throttler_shards.iter().zip(&dead_ids) {
            if ids.is_empty() {
                continue;
            }
            let mut total_limits = shard.total_limits.write();
            for id in ids {
                total_limits.remove(*id);
            }
        }

        for (shard, ids) in self.throttler_shards.iter().zip(&dead_ids) {
            if ids.is_empty() {
                continue;
            }
            let mut uniform_limits = shard.uniform_limits.write();
            for id in ids {
                uniform_limits.remove(*id);
            }
        }

        for shard in &self.member_shards {
            let mut limits = shard.limits.write();
            limits.retain(|member_id, member_limits| {
                member_limits.retain(|id, _| !dead.contains(id));
                !dead_members.contains(member_id) && !member_limits.is_empty()
            });
        }

        for shard in &self.member_shards {
            let mut usage_rates = shard.usage_rates.write();
            usage_rates.retain(|member_id, usage| {
                if dead_members.contains(member_id) && is_dead(usage.updated_at) {
                    return false;
                }
                usage.rates.retain(|id, _| !dead.contains(id));
                true
            });
        }

        for (shard, ids) in self.throttler_shards.iter().zip(&dead_ids) {
            if ids.is_empty() {
                continue;
            }
            let mut last_update = shard.last_update.write();
            for id in ids {
                // Reported again since the read pass.
                if last_update.get(*id).is_some_and(|updated_at| is_dead(*updated_at)) {
                    last_update.remove(*id);
                }
            }
        }
    }

    #[cfg(test)]
    fn total_limit(&self, throttler_id: &str) -> Option<Option<f64>> {
        self.throttler_shard(throttler_id).total_limits.read().get(throttler_id).copied()
    }

    #[cfg(test)]
    fn knows_throttler(&self, throttler_id: &str) -> bool {
        let shard = self.throttler_shard(throttler_id);
        shard.total_limits.read().contains_key(throttler_id)
            || shard.uniform_limits.read().contains_key(throttler_id)
            || shard.last_update.read().contains_key(throttler_id)
            || self.member_shards.iter().any(|shard| {
                shard.limits.read().values().any(|limits| limits.contains_key(throttler_id))
                    || shard.usage_rates.read().values().any(|usage| usage.rates.contains_key(throttler_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RpcServerConfig, ThroughputThrottlerConfig};
    use crate::discovery::{InMemoryDiscovery, MemberClient};
    use crate::error::ErrorCode;
    use crate::messages::ThrottlerUsage;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        discovery: InMemoryDiscovery,
        registry: Arc<ThrottlerRegistry<WrappedThrottler>>,
        rpc_server: Arc<RpcServer>,
        service: Arc<DistributedThrottlerService>,
    }

    fn fixture(mode: ThrottlerMode) -> Fixture {
        let discovery = InMemoryDiscovery::new();
        let registry = Arc::new(ThrottlerRegistry::new());
        let rpc_server = RpcServer::new(RpcServerConfig::default());
        let config = Arc::new(DistributedThrottlerConfig {
            mode,
            throttler_expiration_time: Duration::from_secs(30),
            ..Default::default()
        });
        let service = DistributedThrottlerService::new(
            Arc::new(discovery.clone()),
            "group".to_string(),
            Uuid::new_v4(),
            registry.clone(),
            rpc_server.clone(),
            config,
        );
        Fixture {
            discovery,
            registry,
            rpc_server,
            service,
        }
    }

    fn heartbeat(member_id: &str, usage: &[(&str, f64)]) -> HeartbeatRequest {
        HeartbeatRequest {
            member_id: member_id.to_string(),
            throttlers: usage
                .iter()
                .map(|(id, rate)| ThrottlerUsage {
                    id: id.to_string(),
                    usage_rate: *rate,
                })
                .collect(),
        }
    }

    fn limit_of(response: &HeartbeatResponse, id: &str) -> Option<Option<f64>> {
        response.throttlers.iter().find(|t| t.id == id).map(|t| t.limit)
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_response_precedes_usage_update() {
        let f = fixture(ThrottlerMode::Adaptive);
        f.service.set_total_limit("t", Some(100.0));

        f.service.heartbeat(heartbeat("a", &[("t", 10.0)])).unwrap();
        f.service.heartbeat(heartbeat("b", &[("t", 10.0)])).unwrap();
        f.service.update_limits().await;

        let before = limit_of(&f.service.heartbeat(heartbeat("a", &[("t", 10.0)])).unwrap(), "t");
        // A usage spike in this call must not show up in this call's response.
        let spiked = limit_of(&f.service.heartbeat(heartbeat("a", &[("t", 10_000.0)])).unwrap(), "t");
        assert_eq!(before, spiked);

        // D = 100 (sum of usage is 20), extra = (10 + 80) / 2.
        let limit = spiked.flatten().unwrap();
        assert!((limit - 55.0).abs() < 1e-6, "limit = {}", limit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_unlimited_throttlers() {
        let f = fixture(ThrottlerMode::Adaptive);
        f.service.set_total_limit("unlimited", None);

        let response = f
            .service
            .heartbeat(heartbeat("a", &[("unlimited", 1.0), ("unknown", 1.0)]))
            .unwrap();
        assert_eq!(limit_of(&response, "unlimited"), Some(None));
        assert_eq!(limit_of(&response, "unknown"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_distribution_matches_water_filling() {
        let f = fixture(ThrottlerMode::Adaptive);
        f.service.set_total_limit("t", Some(300.0));
        f.service.update_usage_rate("a", HashMap::from([("t".to_string(), 100.0)]));
        f.service.update_usage_rate("b", HashMap::from([("t".to_string(), 250.0)]));
        f.service.update_usage_rate("c", HashMap::from([("t".to_string(), 10.0)]));
        f.service.update_limits().await;

        let limits: Vec<f64> = ["a", "b", "c"]
            .iter()
            .map(|member| f.service.get_member_limits(member, ["t"])["t"].unwrap())
            .collect();

        // D = 190 and extra = 30 / 3.
        assert!((limits[0] - 110.0).abs() < 1e-6);
        assert!((limits[1] - 200.0).abs() < 1e-6);
        assert!((limits[2] - 20.0).abs() < 1e-6);
        let total: f64 = limits.iter().sum();
        assert!((total - 330.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uniform_distribution() {
        let f = fixture(ThrottlerMode::Uniform);
        let members: Vec<_> = (0..4)
            .map(|i| f.discovery.member_client("group", &format!("m{}", i)))
            .collect();
        for member in &members {
            member.start().await.unwrap();
        }

        f.service.set_total_limit("t", Some(100.0));
        f.service.set_total_limit("tiny", Some(2.0));
        f.service.update_limits().await;
        f.service.update_limits().await;

        for member in ["m0", "m3", "somebody-else"] {
            let limits = f.service.get_member_limits(member, ["t", "tiny"]);
            assert_eq!(limits["t"], Some(25.0));
            assert_eq!(limits["tiny"], Some(1.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_uniform_distribution_keeps_limits_when_discovery_fails() {
        let f = fixture(ThrottlerMode::Uniform);
        let member = f.discovery.member_client("group", "m0");
        member.start().await.unwrap();
        f.service.set_total_limit("t", Some(100.0));
        f.service.update_limits().await;

        f.discovery.set_available(false);
        f.service.set_total_limit("t", Some(50.0));
        f.service.update_limits().await;
        assert_eq!(f.service.get_member_limits("m0", ["t"])["t"], Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_throttlers_are_forgotten_everywhere() {
        let f = fixture(ThrottlerMode::Adaptive);
        f.service.set_total_limit("t", Some(100.0));
        f.service.update_usage_rate("a", HashMap::from([("t".to_string(), 5.0)]));
        f.service.update_limits().await;
        assert!(f.service.knows_throttler("t"));

        tokio::time::advance(Duration::from_secs(31)).await;
        f.service.update_limits().await;
        assert!(!f.service.knows_throttler("t"));
        assert!(f.service.get_member_limits("a", ["t"]).is_empty());

        // Reintroduced throttlers start from a clean slate.
        f.service.set_total_limit("t", Some(40.0));
        assert_eq!(f.service.total_limit("t"), Some(Some(40.0)));
        let response = f.service.heartbeat(heartbeat("a", &[("t", 1.0)])).unwrap();
        assert_eq!(limit_of(&response, "t"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_throttlers_survive() {
        let f = fixture(ThrottlerMode::Adaptive);
        f.service.set_total_limit("t", Some(100.0));
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            f.service.update_usage_rate("a", HashMap::from([("t".to_string(), 5.0)]));
            f.service.update_limits().await;
        }
        assert_eq!(f.service.total_limit("t"), Some(Some(100.0)));
        assert!(f.service.get_member_limits("a", ["t"])["t"].is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_mismatch() {
        let f = fixture(ThrottlerMode::Precise);
        let err = assert_err!(f.service.heartbeat(heartbeat("a", &[])));
        assert_eq!(err.code(), ErrorCode::UnexpectedThrottlerMode);

        let f = fixture(ThrottlerMode::Adaptive);
        let err = assert_err!(f.service.throttle("t", 1).await);
        assert_eq!(err.code(), ErrorCode::UnexpectedThrottlerMode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_uses_leader_throttler() {
        let f = fixture(ThrottlerMode::Precise);
        let err = assert_err!(f.service.throttle("t", 1).await);
        assert_eq!(err.code(), ErrorCode::NoSuchThrottler);

        let config = f.service.config();
        let throttler = f.registry.get_or_create(
            "t",
            |_| {},
            || {
                Arc::new(WrappedThrottler::new(
                    "t".to_string(),
                    config.clone(),
                    ThroughputThrottlerConfig::with_limit(10.0),
                    Duration::from_secs(1),
                ))
            },
        );
        assert_ok!(f.service.throttle("t", 3).await);
        drop(throttler);
        assert_err!(f.service.throttle("t", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_and_finalize_transitions() {
        let f = fixture(ThrottlerMode::Adaptive);
        assert!(f.service.initialize());
        assert!(!f.service.initialize());
        assert!(f.service.is_initialized());
        assert!(f.rpc_server.find_service(Some(f.service.realm_id())).is_ok());

        assert!(f.service.finalize().await);
        assert!(!f.service.finalize().await);
        assert!(f.rpc_server.find_service(None).is_err());
    }
}
