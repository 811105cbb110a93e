//! Redis-backed discovery.
//!
//! Layout, for group `g` under prefix `p`:
//! - `p:g:members` sorted set of member ids scored by priority;
//! - `p:g:member:<id>` hash of the member's attributes, expiring after the
//!   lease timeout unless the member refreshes it.
//!
//! A member whose hash expired is removed from the sorted set by the next
//! reader.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{DiscoveryClientConfig, MemberClientConfig};
use crate::discovery::{
    filter_attributes, sort_members, DiscoveryClient, GroupMeta, ListMembersOptions, MemberClient, MemberInfo,
};
use crate::error::{Error, Result};
use crate::periodic::{BoxFuture, Callback, PeriodicExecutor};

/// Keeps the hash alive even when the member has no attributes yet.
const LEASE_FIELD: &str = "_lease";

fn members_key(prefix: &str, group_id: &str) -> String {
    format!("{}:{}:members", prefix, group_id)
}

fn member_key(prefix: &str, group_id: &str, member_id: &str) -> String {
    format!("{}:{}:member:{}", prefix, group_id, member_id)
}

/// Shared connection to Redis, reconnected lazily after failures.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    connection: Arc<tokio::sync::Mutex<Option<MultiplexedConnection>>>,
}

impl RedisClient {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Discovery(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Discovery(format!("Failed to connect to Redis: {}", e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    /// Run `op` on a connection within `timeout`; the cached connection is
    /// dropped on failure so the next call reconnects.
    async fn run<T, F, Fut>(&self, timeout: Duration, op: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        let result = match tokio::time::timeout(timeout, op(conn)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => Error::from(e),
            Err(_) => Error::Discovery(format!("Redis request timed out after {:?}", timeout)),
        };
        self.reset().await;
        Err(result)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<String> {
        self.run(timeout, |mut conn| async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await
    }
}

pub struct RedisDiscoveryClient {
    redis: RedisClient,
    config: RwLock<DiscoveryClientConfig>,
}

impl RedisDiscoveryClient {
    pub fn new(redis: RedisClient, config: DiscoveryClientConfig) -> Self {
        Self {
            redis,
            config: RwLock::new(config),
        }
    }

    /// Live members in priority order; expired ones are removed on the way.
    async fn live_members(&self, group_id: &str, limit: Option<usize>) -> Result<Vec<MemberInfo>> {
        let config = self.config.read().clone();
        let members_key = members_key(&config.key_prefix, group_id);

        let entries: Vec<String> = {
            let key = members_key.clone();
            self.redis
                .run(config.read_timeout, |mut conn| async move {
                    redis::cmd("ZRANGE")
                        .arg(&key)
                        .arg(0)
                        .arg(-1)
                        .arg("WITHSCORES")
                        .query_async(&mut conn)
                        .await
                })
                .await?
        };

        let mut members = Vec::new();
        let mut expired = Vec::new();
        for pair in entries.chunks_exact(2) {
            if limit.is_some_and(|limit| members.len() >= limit) {
                break;
            }

            let member_id = pair[0].clone();
            let priority = pair[1]
                .parse::<f64>()
                .map_err(|e| Error::Discovery(format!("Invalid priority of member {:?}: {}", member_id, e)))?;

            let key = member_key(&config.key_prefix, group_id, &member_id);
            let mut attributes: HashMap<String, String> = self
                .redis
                .run(config.read_timeout, |mut conn| async move {
                    redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await
                })
                .await?;

            if attributes.is_empty() {
                expired.push(member_id);
                continue;
            }
            attributes.remove(LEASE_FIELD);

            members.push(MemberInfo {
                id: member_id,
                priority: priority as i64,
                attributes,
            });
        }

        if !expired.is_empty() {
            debug!(group_id = %group_id, expired = ?expired, "Pruning expired members");
            let key = members_key;
            self.redis
                .run(config.read_timeout, |mut conn| async move {
                    redis::cmd("ZREM").arg(&key).arg(&expired).query_async::<_, ()>(&mut conn).await
                })
                .await?;
        }

        sort_members(&mut members);
        Ok(members)
    }
}

#[async_trait]
impl DiscoveryClient for RedisDiscoveryClient {
    async fn list_members(&self, group_id: &str, options: ListMembersOptions) -> Result<Vec<MemberInfo>> {
        let members = self.live_members(group_id, options.limit).await?;
        Ok(members
            .into_iter()
            .map(|member| MemberInfo {
                attributes: filter_attributes(member.attributes, &options.attribute_keys),
                ..member
            })
            .collect())
    }

    async fn get_group_meta(&self, group_id: &str) -> Result<GroupMeta> {
        let members = self.live_members(group_id, None).await?;
        Ok(GroupMeta {
            member_count: members.len(),
        })
    }

    fn reconfigure(&self, config: DiscoveryClientConfig) {
        *self.config.write() = config;
    }
}

#[derive(Debug, Default)]
struct Registration {
    priority: i64,
    attributes: HashMap<String, String>,
}

/// Registers one member and keeps its lease alive.
pub struct RedisMemberClient {
    redis: RedisClient,
    key_prefix: String,
    group_id: String,
    member_id: String,
    config: RwLock<MemberClientConfig>,
    registration: Mutex<Registration>,
    executor: PeriodicExecutor,
}

impl RedisMemberClient {
    pub fn new(
        redis: RedisClient,
        key_prefix: &str,
        group_id: &str,
        member_id: &str,
        config: MemberClientConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let callback: Callback = Arc::new(move || -> BoxFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(member) = weak.upgrade() {
                        if let Err(e) = member.refresh().await {
                            warn!(member_id = %member.member_id, error = %e, "Failed to refresh member registration");
                        }
                    }
                })
            });

            Self {
                redis,
                key_prefix: key_prefix.to_string(),
                group_id: group_id.to_string(),
                member_id: member_id.to_string(),
                executor: PeriodicExecutor::new("member_heartbeat", config.heartbeat_period, callback),
                config: RwLock::new(config),
                registration: Mutex::new(Registration::default()),
            }
        })
    }

    async fn refresh(&self) -> Result<()> {
        let (priority, mut fields): (i64, Vec<(String, String)>) = {
            let registration = self.registration.lock();
            (
                registration.priority,
                registration
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };
        fields.push((LEASE_FIELD.to_string(), "1".to_string()));

        let config = self.config.read().clone();
        let members_key = members_key(&self.key_prefix, &self.group_id);
        let member_key = member_key(&self.key_prefix, &self.group_id, &self.member_id);
        let member_id = self.member_id.clone();
        let lease_ms = config.lease_timeout.as_millis() as u64;

        self.redis
            .run(config.lease_timeout, |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("ZADD").arg(&members_key).arg(priority).arg(&member_id).ignore();
                pipe.cmd("DEL").arg(&member_key).ignore();
                pipe.cmd("HSET").arg(&member_key).arg(&fields).ignore();
                pipe.cmd("PEXPIRE").arg(&member_key).arg(lease_ms).ignore();
                pipe.query_async::<_, ()>(&mut conn).await
            })
            .await
    }
}

#[async_trait]
impl MemberClient for RedisMemberClient {
    fn set_attribute(&self, key: &str, value: String) {
        self.registration.lock().attributes.insert(key.to_string(), value);
        if self.executor.is_running() {
            self.executor.schedule_out_of_band();
        }
    }

    fn set_priority(&self, priority: i64) {
        self.registration.lock().priority = priority;
        if self.executor.is_running() {
            self.executor.schedule_out_of_band();
        }
    }

    /// Registration is refreshed in the background right away; failures are
    /// logged and retried every heartbeat period.
    async fn start(&self) -> Result<()> {
        self.executor.start();
        debug!(group_id = %self.group_id, member_id = %self.member_id, "Member registration started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.executor.stop().await;

        let config = self.config.read().clone();
        let members_key = members_key(&self.key_prefix, &self.group_id);
        let member_key = member_key(&self.key_prefix, &self.group_id, &self.member_id);
        let member_id = self.member_id.clone();
        self.redis
            .run(config.lease_timeout, |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.cmd("ZREM").arg(&members_key).arg(&member_id).ignore();
                pipe.cmd("DEL").arg(&member_key).ignore();
                pipe.query_async::<_, ()>(&mut conn).await
            })
            .await?;

        debug!(group_id = %self.group_id, member_id = %self.member_id, "Member unregistered");
        Ok(())
    }

    fn reconfigure(&self, config: MemberClientConfig) {
        self.executor.set_period(config.heartbeat_period);
        *self.config.write() = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(members_key("dt", "uploads"), "dt:uploads:members");
        assert_eq!(member_key("dt", "uploads", "node-1"), "dt:uploads:member:node-1");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisClient::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_member_client_buffers_attributes_until_started() {
        let redis = RedisClient::new("redis://127.0.0.1:1").unwrap();
        let member = RedisMemberClient::new(redis, "dt", "g", "m", MemberClientConfig::default());
        member.set_priority(42);
        member.set_attribute("address", "127.0.0.1:9013".to_string());

        let registration = member.registration.lock();
        assert_eq!(registration.priority, 42);
        assert_eq!(registration.attributes["address"], "127.0.0.1:9013");
        assert!(!member.executor.is_running());
    }
}
