//! Entry point of the library: hands out distributed throttlers and runs the
//! member-side control loops.
//!
//! Each process builds one [`DistributedThrottlerFactory`], starts it, asks it
//! for throttlers by id and stops it on shutdown. The factory keeps track of
//! the group leader, reports usage to it and applies the limits it returns.
//! When this process is the leader it also runs the
//! [`DistributedThrottlerService`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::{DistributedThrottlerConfig, ThrottlerMode, ThroughputThrottlerConfig};
use crate::discovery::{
    DiscoveryClient, ListMembersOptions, MemberClient, ADDRESS_ATTRIBUTE_KEY, LEADER_ID_ATTRIBUTE_KEY,
    REALM_ID_ATTRIBUTE_KEY,
};
use crate::error::Result;
use crate::messages::{HeartbeatRequest, ThrottlerUsage};
use crate::periodic::{BoxFuture, Callback, PeriodicExecutor};
use crate::proxy::{ChannelFactory, DistributedThrottlerProxy, LeaderChannel};
use crate::registry::ThrottlerRegistry;
use crate::server::RpcServer;
use crate::service::DistributedThrottlerService;
use crate::throttler::{ReconfigurableThroughputThrottler, WrappedThrottler};
use crate::validation::{validate_group_id, validate_member_id, validate_throttler_id};

#[derive(Debug, Default)]
struct Leadership {
    leader_id: Option<String>,
    leader_realm_id: Option<Uuid>,
    leader_channel: Option<LeaderChannel>,
}

/// Collaborators of a factory.
pub struct FactoryOptions {
    pub group_id: String,
    pub member_id: String,
    /// Address other members use to reach `rpc_server`.
    pub address: String,
    pub channel_factory: ChannelFactory,
    pub discovery: Arc<dyn DiscoveryClient>,
    pub member_client: Arc<dyn MemberClient>,
    pub rpc_server: Arc<RpcServer>,
}

#[derive(Clone)]
pub struct DistributedThrottlerFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    group_id: String,
    member_id: String,
    realm_id: Uuid,
    config: RwLock<Arc<DistributedThrottlerConfig>>,
    channel_factory: ChannelFactory,
    discovery: Arc<dyn DiscoveryClient>,
    member_client: Arc<dyn MemberClient>,
    registry: Arc<ThrottlerRegistry<WrappedThrottler>>,
    service: Arc<DistributedThrottlerService>,
    leadership: RwLock<Leadership>,
    update_limits_executor: PeriodicExecutor,
    update_leader_executor: PeriodicExecutor,
}

fn executor_callback<F>(weak: Weak<FactoryInner>, run: F) -> Callback
where
    F: Fn(Arc<FactoryInner>) -> BoxFuture + Send + Sync + 'static,
{
    let run = Arc::new(run);
    Arc::new(move || -> BoxFuture {
        let weak = weak.clone();
        let run = run.clone();
        Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                run(inner).await;
            }
        })
    })
}

impl DistributedThrottlerFactory {
    pub fn new(config: DistributedThrottlerConfig, options: FactoryOptions) -> Result<Self> {
        config.validate()?;
        validate_group_id(&options.group_id)?;
        validate_member_id(&options.member_id)?;

        let config = Arc::new(config);
        let realm_id = Uuid::new_v4();
        let registry = Arc::new(ThrottlerRegistry::new());
        let service = DistributedThrottlerService::new(
            options.discovery.clone(),
            options.group_id.clone(),
            realm_id,
            registry.clone(),
            options.rpc_server,
            config.clone(),
        );

        let member_client = options.member_client;
        member_client.set_attribute(REALM_ID_ATTRIBUTE_KEY, realm_id.to_string());
        member_client.set_attribute(ADDRESS_ATTRIBUTE_KEY, options.address);
        member_client.set_priority(start_time_seconds());

        let inner = Arc::new_cyclic(|weak: &Weak<FactoryInner>| FactoryInner {
            update_limits_executor: PeriodicExecutor::new(
                "update_limits",
                config.limit_update_period,
                executor_callback(weak.clone(), |inner| -> BoxFuture {
                    Box::pin(async move { inner.update_limits().await })
                }),
            ),
            update_leader_executor: PeriodicExecutor::new(
                "update_leader",
                config.leader_update_period,
                executor_callback(weak.clone(), |inner| -> BoxFuture {
                    Box::pin(async move { inner.update_leader().await })
                }),
            ),
            group_id: options.group_id,
            member_id: options.member_id,
            realm_id,
            config: RwLock::new(config),
            channel_factory: options.channel_factory,
            discovery: options.discovery,
            member_client,
            registry,
            service,
            leadership: RwLock::new(Leadership::default()),
        });

        info!(
            group_id = %inner.group_id,
            member_id = %inner.member_id,
            realm_id = %inner.realm_id,
            "Distributed throttler factory created"
        );
        Ok(Self { inner })
    }

    /// Throttler for `throttler_id`, created on first use.
    ///
    /// `config.limit` is the total for the whole group. An existing throttler
    /// is reconfigured with `config`. `throttle_rpc_timeout` defaults to the
    /// factory's `throttle_rpc_timeout`.
    pub fn get_or_create_throttler(
        &self,
        throttler_id: &str,
        config: ThroughputThrottlerConfig,
        throttle_rpc_timeout: Option<Duration>,
    ) -> Result<Arc<WrappedThrottler>> {
        validate_throttler_id(throttler_id)?;
        config.validate()?;

        let inner = &self.inner;
        let distributed_config = inner.config();
        let timeout = throttle_rpc_timeout.unwrap_or(distributed_config.throttle_rpc_timeout);
        let found_config = config.clone();

        let throttler = inner.registry.get_or_create(
            throttler_id,
            |throttler| throttler.reconfigure(found_config),
            || {
                inner.service.set_total_limit(throttler_id, config.limit);
                let throttler = Arc::new(WrappedThrottler::new(
                    throttler_id.to_string(),
                    distributed_config,
                    config,
                    timeout,
                ));
                throttler.set_leader_channel(inner.leadership.read().leader_channel.clone());
                info!(throttler_id = %throttler_id, "Distributed throttler created");
                throttler
            },
        );
        Ok(throttler)
    }

    pub fn reconfigure(&self, config: DistributedThrottlerConfig) -> Result<()> {
        config.validate()?;
        self.inner.reconfigure(Arc::new(config));
        Ok(())
    }

    /// Register in the group and start the control loops.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.member_client.start().await?;
        inner.update_limits_executor.start();
        inner.update_leader_executor.start();
        info!(group_id = %inner.group_id, member_id = %inner.member_id, "Distributed throttler factory started");
        Ok(())
    }

    /// Leave the group, stop the loops and give up leadership.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if let Err(e) = inner.member_client.stop().await {
            warn!(member_id = %inner.member_id, error = %e, "Failed to leave the group");
        }

        inner.update_limits_executor.stop().await;
        inner.update_leader_executor.stop().await;

        let was_leader = {
            let mut leadership = inner.leadership.write();
            let was_leader = leadership.leader_id.as_deref() == Some(inner.member_id.as_str());
            *leadership = Leadership::default();
            was_leader
        };
        if was_leader {
            inner.service.finalize().await;
        }
        info!(group_id = %inner.group_id, member_id = %inner.member_id, "Distributed throttler factory stopped");
    }

    /// One iteration of the limit loop.
    pub async fn update_limits(&self) {
        self.inner.update_limits().await;
    }

    /// One iteration of the leader loop.
    pub async fn update_leader(&self) {
        self.inner.update_leader().await;
    }

    pub fn leader_id(&self) -> Option<String> {
        self.inner.leadership.read().leader_id.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_id().as_deref() == Some(self.inner.member_id.as_str())
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn realm_id(&self) -> Uuid {
        self.inner.realm_id
    }

    pub fn config(&self) -> Arc<DistributedThrottlerConfig> {
        self.inner.config()
    }

    pub fn service(&self) -> &Arc<DistributedThrottlerService> {
        &self.inner.service
    }
}

impl FactoryInner {
    fn config(&self) -> Arc<DistributedThrottlerConfig> {
        self.config.read().clone()
    }

    fn reconfigure(&self, config: Arc<DistributedThrottlerConfig>) {
        self.member_client.reconfigure(config.member_client.clone());
        self.discovery.reconfigure(config.discovery_client.clone());

        let old = self.config();
        if old.limit_update_period != config.limit_update_period {
            self.update_limits_executor.set_period(config.limit_update_period);
        }
        if old.leader_update_period != config.leader_update_period {
            self.update_leader_executor.set_period(config.leader_update_period);
        }

        self.service.reconfigure(config.clone());

        let entering_precise = old.mode != ThrottlerMode::Precise && config.mode == ThrottlerMode::Precise;
        let leader_channel = self.leadership.read().leader_channel.clone();
        for throttler in self.registry.alive() {
            throttler.set_distributed_config(config.clone());
            if entering_precise {
                throttler.set_leader_channel(leader_channel.clone());
            }
        }

        *self.config.write() = config;
        debug!(member_id = %self.member_id, "Distributed throttler factory reconfigured");
    }

    async fn update_limits(&self) {
        let config = self.config();
        if config.mode == ThrottlerMode::Precise {
            return;
        }

        let leader_id = self.leadership.read().leader_id.clone();
        let Some(leader_id) = leader_id else {
            debug!(member_id = %self.member_id, "Leader is not known yet");
            self.update_leader_executor.schedule_out_of_band();
            return;
        };

        let throttlers = self.registry.snapshot();

        if leader_id == self.member_id {
            self.update_limits_at_leader(&throttlers);
            return;
        }

        let channel = self.leadership.read().leader_channel.clone();
        let Some(channel) = channel else {
            warn!(leader_id = %leader_id, "Failed updating throttler limit: no active leader");
            return;
        };

        let request = HeartbeatRequest {
            member_id: self.member_id.clone(),
            throttlers: throttlers
                .iter()
                .map(|(id, throttler)| ThrottlerUsage {
                    id: id.clone(),
                    usage_rate: throttler.usage_rate(),
                })
                .collect(),
        };

        let response = match DistributedThrottlerProxy::new(channel)
            .heartbeat(&request, config.control_rpc_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(leader_id = %leader_id, error = %e, "Failed updating throttler limit");
                return;
            }
        };

        for limit in response.throttlers {
            match throttlers.get(&limit.id) {
                Some(throttler) => {
                    throttler.set_limit(limit.limit);
                    trace!(leader_id = %leader_id, throttler_id = %limit.id, limit = ?limit.limit, "Throttler limit updated");
                }
                None => debug!(throttler_id = %limit.id, "Leader returned a limit for an unknown throttler"),
            }
        }
    }

    /// Leader-side counterpart of a heartbeat: refresh totals and usage in
    /// the local service and apply its limits directly.
    fn update_limits_at_leader(&self, throttlers: &HashMap<String, Arc<WrappedThrottler>>) {
        let mut usage_rates = HashMap::with_capacity(throttlers.len());
        for (id, throttler) in throttlers {
            self.service.set_total_limit(id, throttler.config().limit);
            usage_rates.insert(id.clone(), throttler.usage_rate());
        }

        let limits = self
            .service
            .get_member_limits(&self.member_id, usage_rates.keys().map(String::as_str));
        for (id, limit) in limits {
            if let Some(throttler) = throttlers.get(&id) {
                throttler.set_limit(limit);
                trace!(throttler_id = %id, limit = ?limit, "Throttler limit updated");
            }
        }

        self.service.update_usage_rate(&self.member_id, usage_rates);
    }

    async fn update_leader(&self) {
        let options = ListMembersOptions {
            limit: Some(1),
            attribute_keys: vec![ADDRESS_ATTRIBUTE_KEY.to_string(), REALM_ID_ATTRIBUTE_KEY.to_string()],
        };

        let members = match self.discovery.list_members(&self.group_id, options).await {
            Ok(members) => members,
            Err(e) => {
                warn!(group_id = %self.group_id, error = %e, "Error updating leader");
                return;
            }
        };

        let Some(leader) = members.into_iter().next() else {
            return;
        };

        let Some(address) = leader.attributes.get(ADDRESS_ATTRIBUTE_KEY) else {
            warn!(leader_id = %leader.id, "Leader does not have {:?} attribute", ADDRESS_ATTRIBUTE_KEY);
            return;
        };

        let realm_id = match leader.attributes.get(REALM_ID_ATTRIBUTE_KEY).map(|realm| Uuid::parse_str(realm)) {
            Some(Ok(realm_id)) => realm_id,
            Some(Err(e)) => {
                warn!(leader_id = %leader.id, error = %e, "Leader has malformed {:?} attribute", REALM_ID_ATTRIBUTE_KEY);
                return;
            }
            None => {
                warn!(leader_id = %leader.id, "Leader does not have {:?} attribute", REALM_ID_ATTRIBUTE_KEY);
                return;
            }
        };

        let is_self = leader.id == self.member_id;
        let (old_leader_id, leader_channel) = {
            let mut leadership = self.leadership.write();
            if leadership.leader_id.as_deref() == Some(leader.id.as_str())
                && leadership.leader_realm_id == Some(realm_id)
            {
                return;
            }

            info!(
                old_leader_id = ?leadership.leader_id,
                new_leader_id = %leader.id,
                realm_id = %realm_id,
                "Leader changed"
            );
            self.member_client.set_attribute(LEADER_ID_ATTRIBUTE_KEY, leader.id.clone());

            let old_leader_id = leadership.leader_id.replace(leader.id.clone());
            leadership.leader_realm_id = Some(realm_id);
            leadership.leader_channel = if is_self {
                None
            } else {
                Some(self.channel_factory.create_channel(address, realm_id))
            };
            (old_leader_id, leadership.leader_channel.clone())
        };

        if self.config().mode == ThrottlerMode::Precise {
            for throttler in self.registry.alive() {
                throttler.set_leader_channel(leader_channel.clone());
            }
        }

        let was_self = old_leader_id.as_deref() == Some(self.member_id.as_str());
        if was_self && !is_self {
            self.service.finalize().await;
        }
        if is_self && !was_self {
            self.service.initialize();
        }
    }
}

fn start_time_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcServerConfig;
    use crate::discovery::InMemoryDiscovery;
    use crate::error::ErrorCode;
    use crate::throttler::ThroughputThrottler;
    use std::sync::Barrier;
    use std::thread;
    use tokio_test::{assert_err, assert_ok};

    struct Member {
        factory: DistributedThrottlerFactory,
        rpc_server: Arc<RpcServer>,
    }

    fn member(discovery: &InMemoryDiscovery, member_id: &str, priority: i64, mode: ThrottlerMode) -> Member {
        let rpc_server = RpcServer::new(RpcServerConfig::default());
        let member_client = Arc::new(discovery.member_client("group", member_id));
        let factory = DistributedThrottlerFactory::new(
            DistributedThrottlerConfig {
                mode,
                ..Default::default()
            },
            FactoryOptions {
                group_id: "group".to_string(),
                member_id: member_id.to_string(),
                address: format!("127.0.0.1:{}", 20000 + priority),
                channel_factory: ChannelFactory::new().unwrap(),
                discovery: Arc::new(discovery.clone()),
                member_client: member_client.clone(),
                rpc_server: rpc_server.clone(),
            },
        )
        .unwrap();
        // Start times in tests are too close to order members reliably.
        member_client.set_priority(priority);
        Member { factory, rpc_server }
    }

    #[test]
    fn test_concurrent_get_or_create_yields_one_throttler() {
        let discovery = InMemoryDiscovery::new();
        let factory = member(&discovery, "m", 1, ThrottlerMode::Adaptive).factory;
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    factory
                        .get_or_create_throttler("shared", ThroughputThrottlerConfig::with_limit(10.0), None)
                        .unwrap()
                })
            })
            .collect();

        let throttlers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(throttlers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(throttlers[0].config().limit, Some(10.0));
    }

    #[tokio::test]
    async fn test_existing_throttler_is_reconfigured() {
        let discovery = InMemoryDiscovery::new();
        let factory = member(&discovery, "m", 1, ThrottlerMode::Adaptive).factory;

        let first = assert_ok!(factory.get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(10.0), None));
        let second = assert_ok!(factory.get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(20.0), None));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().limit, Some(20.0));

        let err = assert_err!(factory.get_or_create_throttler("bad id", ThroughputThrottlerConfig::default(), None));
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_leadership_handoff() {
        let discovery = InMemoryDiscovery::new();
        let a = member(&discovery, "a", 1, ThrottlerMode::Adaptive);
        let b = member(&discovery, "b", 2, ThrottlerMode::Adaptive);
        a.factory.inner.member_client.start().await.unwrap();
        b.factory.inner.member_client.start().await.unwrap();

        a.factory.update_leader().await;
        b.factory.update_leader().await;
        assert!(a.factory.is_leader());
        assert_eq!(b.factory.leader_id().as_deref(), Some("a"));
        assert!(a.factory.service().is_initialized());
        assert!(!b.factory.service().is_initialized());
        assert!(a.rpc_server.registered_realm().is_some());
        assert_eq!(discovery.attributes("group", "b").unwrap()[LEADER_ID_ATTRIBUTE_KEY], "a");

        // Repeated observations change nothing.
        a.factory.update_leader().await;
        assert!(a.factory.service().is_initialized());

        // `b` takes over once `a` gets a worse priority.
        a.factory.inner.member_client.set_priority(10);
        a.factory.update_leader().await;
        b.factory.update_leader().await;
        assert!(!a.factory.service().is_initialized());
        assert!(a.rpc_server.registered_realm().is_none());
        assert!(b.factory.is_leader());
        assert!(b.factory.service().is_initialized());

        b.factory.stop().await;
        assert!(!b.factory.service().is_initialized());
        assert!(b.factory.leader_id().is_none());
    }

    #[tokio::test]
    async fn test_discovery_failure_keeps_leadership() {
        let discovery = InMemoryDiscovery::new();
        let a = member(&discovery, "a", 1, ThrottlerMode::Adaptive);
        a.factory.inner.member_client.start().await.unwrap();
        a.factory.update_leader().await;
        assert!(a.factory.is_leader());

        discovery.set_available(false);
        a.factory.update_leader().await;
        assert!(a.factory.is_leader());
        assert!(a.factory.service().is_initialized());
        a.factory.stop().await;
    }

    #[tokio::test]
    async fn test_leader_applies_its_own_limits() {
        let discovery = InMemoryDiscovery::new();
        let a = member(&discovery, "a", 1, ThrottlerMode::Adaptive);
        a.factory.inner.member_client.start().await.unwrap();
        let throttler = a
            .factory
            .get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(100.0), None)
            .unwrap();

        // No leader yet: nothing happens.
        a.factory.update_limits().await;
        assert_eq!(throttler.current_limit(), Some(100.0));

        a.factory.update_leader().await;
        assert_ok!(throttler.acquire(10));

        // The first round only reports usage, the leader loop then allocates.
        a.factory.update_limits().await;
        a.factory.service().update_limits().await;
        a.factory.update_limits().await;

        // Single member with usage u: limit = u + 0.1 * 100 + (100 - u).
        let limit = throttler.current_limit().unwrap();
        assert!((limit - 110.0).abs() < 1e-6, "limit = {}", limit);
        a.factory.stop().await;
    }

    #[tokio::test]
    async fn test_precise_channels_follow_leader() {
        let discovery = InMemoryDiscovery::new();
        let a = member(&discovery, "a", 1, ThrottlerMode::Precise);
        let b = member(&discovery, "b", 2, ThrottlerMode::Precise);
        a.factory.inner.member_client.start().await.unwrap();
        b.factory.inner.member_client.start().await.unwrap();

        let on_b = b
            .factory
            .get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(5.0), None)
            .unwrap();
        assert!(on_b.leader_channel().is_none());

        b.factory.update_leader().await;
        let channel = on_b.leader_channel().unwrap();
        assert_eq!(channel.address(), "127.0.0.1:20001");
        assert_eq!(channel.realm_id(), a.factory.realm_id());

        // Throttlers created later are seeded with the known channel.
        let later = b
            .factory
            .get_or_create_throttler("later", ThroughputThrottlerConfig::default(), None)
            .unwrap();
        assert!(later.leader_channel().is_some());

        a.factory.update_leader().await;
        let on_a = a
            .factory
            .get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(5.0), None)
            .unwrap();
        assert!(on_a.leader_channel().is_none());
        assert_ok!(ThroughputThrottler::throttle(on_a.as_ref(), 1).await);
        a.factory.stop().await;
    }

    #[tokio::test]
    async fn test_reconfigure_propagates_to_throttlers() {
        let discovery = InMemoryDiscovery::new();
        let a = member(&discovery, "a", 1, ThrottlerMode::Adaptive);
        let throttler = a
            .factory
            .get_or_create_throttler("t", ThroughputThrottlerConfig::with_limit(5.0), None)
            .unwrap();
        assert_ok!(throttler.acquire(3));

        assert_ok!(a.factory.reconfigure(DistributedThrottlerConfig {
            mode: ThrottlerMode::Precise,
            leader_update_period: Duration::from_secs(1),
            ..Default::default()
        }));
        assert_eq!(throttler.mode(), ThrottlerMode::Precise);
        assert_eq!(a.factory.service().config().mode, ThrottlerMode::Precise);
        assert_eq!(a.factory.inner.update_leader_executor.period(), Duration::from_secs(1));
        assert_eq!(throttler.usage_rate(), 3.0);
        assert_err!(throttler.try_acquire(1));

        let invalid = DistributedThrottlerConfig {
            extra_limit_ratio: -1.0,
            ..Default::default()
        };
        assert_err!(a.factory.reconfigure(invalid));
    }
}
