//! Group membership used to find the other members and the leader.
//!
//! Members register themselves with a priority and a set of string
//! attributes. Listing a group returns members ordered by ascending priority
//! (ties broken by member id); the first one is the leader.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{DiscoveryClientConfig, MemberClientConfig};
use crate::error::{Error, Result};

pub const ADDRESS_ATTRIBUTE_KEY: &str = "address";
pub const REALM_ID_ATTRIBUTE_KEY: &str = "realm_id";
pub const LEADER_ID_ATTRIBUTE_KEY: &str = "leader_id";

#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub id: String,
    pub priority: i64,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListMembersOptions {
    pub limit: Option<usize>,
    /// Attributes to return; empty means all of them.
    pub attribute_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMeta {
    pub member_count: usize,
}

#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn list_members(&self, group_id: &str, options: ListMembersOptions) -> Result<Vec<MemberInfo>>;

    async fn get_group_meta(&self, group_id: &str) -> Result<GroupMeta>;

    fn reconfigure(&self, config: DiscoveryClientConfig);
}

/// Registration of this process in a group.
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Published with the next registration refresh (immediately if supported).
    fn set_attribute(&self, key: &str, value: String);

    fn set_priority(&self, priority: i64);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn reconfigure(&self, config: MemberClientConfig);
}

pub(crate) fn sort_members(members: &mut [MemberInfo]) {
    members.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn filter_attributes(attributes: HashMap<String, String>, keys: &[String]) -> HashMap<String, String> {
    if keys.is_empty() {
        return attributes;
    }
    attributes
        .into_iter()
        .filter(|(key, _)| keys.iter().any(|k| k == key))
        .collect()
}

#[derive(Debug, Clone)]
struct MemberRecord {
    priority: i64,
    attributes: HashMap<String, String>,
}

/// Process-local discovery: every member and client shares one registry.
///
/// Used by tests and single-process deployments. Can be switched to a failing
/// state to exercise degraded behaviour.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDiscovery {
    groups: Arc<RwLock<HashMap<String, HashMap<String, MemberRecord>>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn member_client(&self, group_id: &str, member_id: &str) -> InMemoryMemberClient {
        InMemoryMemberClient {
            discovery: self.clone(),
            group_id: group_id.to_string(),
            member_id: member_id.to_string(),
            state: Mutex::new(LocalMember {
                priority: 0,
                attributes: HashMap::new(),
                started: false,
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Attributes currently published by a member.
    pub fn attributes(&self, group_id: &str, member_id: &str) -> Option<HashMap<String, String>> {
        self.groups
            .read()
            .get(group_id)
            .and_then(|members| members.get(member_id))
            .map(|record| record.attributes.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Discovery("Discovery is unavailable".to_string()));
        }
        Ok(())
    }

    fn publish(&self, group_id: &str, member_id: &str, record: MemberRecord) {
        self.groups
            .write()
            .entry(group_id.to_string())
            .or_default()
            .insert(member_id.to_string(), record);
    }

    fn remove(&self, group_id: &str, member_id: &str) {
        if let Some(members) = self.groups.write().get_mut(group_id) {
            members.remove(member_id);
        }
    }
}

#[async_trait]
impl DiscoveryClient for InMemoryDiscovery {
    async fn list_members(&self, group_id: &str, options: ListMembersOptions) -> Result<Vec<MemberInfo>> {
        self.check_available()?;

        let mut members: Vec<MemberInfo> = self
            .groups
            .read()
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, record)| MemberInfo {
                        id: id.clone(),
                        priority: record.priority,
                        attributes: filter_attributes(record.attributes.clone(), &options.attribute_keys),
                    })
                    .collect()
            })
            .unwrap_or_default();

        sort_members(&mut members);
        if let Some(limit) = options.limit {
            members.truncate(limit);
        }
        Ok(members)
    }

    async fn get_group_meta(&self, group_id: &str) -> Result<GroupMeta> {
        self.check_available()?;

        let member_count = self.groups.read().get(group_id).map_or(0, HashMap::len);
        Ok(GroupMeta { member_count })
    }

    fn reconfigure(&self, _config: DiscoveryClientConfig) {}
}

#[derive(Debug)]
struct LocalMember {
    priority: i64,
    attributes: HashMap<String, String>,
    started: bool,
}

#[derive(Debug)]
pub struct InMemoryMemberClient {
    discovery: InMemoryDiscovery,
    group_id: String,
    member_id: String,
    state: Mutex<LocalMember>,
}

impl InMemoryMemberClient {
    fn publish(&self, state: &LocalMember) {
        if state.started {
            self.discovery.publish(
                &self.group_id,
                &self.member_id,
                MemberRecord {
                    priority: state.priority,
                    attributes: state.attributes.clone(),
                },
            );
        }
    }
}

#[async_trait]
impl MemberClient for InMemoryMemberClient {
    fn set_attribute(&self, key: &str, value: String) {
        let mut state = self.state.lock();
        state.attributes.insert(key.to_string(), value);
        self.publish(&state);
    }

    fn set_priority(&self, priority: i64) {
        let mut state = self.state.lock();
        state.priority = priority;
        self.publish(&state);
    }

    async fn start(&self) -> Result<()> {
        self.discovery.check_available()?;

        let mut state = self.state.lock();
        state.started = true;
        self.publish(&state);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.lock().started = false;
        self.discovery.remove(&self.group_id, &self.member_id);
        Ok(())
    }

    fn reconfigure(&self, _config: MemberClientConfig) {}
}
