//! Distributed throughput throttling.
//!
//! Processes that share a resource join a discovery group. The oldest member
//! leads: it collects usage from the others and hands out per-member limits
//! so that the group as a whole stays within each throttler's total limit.

pub mod algorithms;
pub mod config;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod messages;
pub mod middleware;
pub mod periodic;
pub mod proxy;
pub mod redis;
pub mod registry;
pub mod server;
pub mod service;
pub mod throttler;
pub mod token_bucket;
pub mod usage;
pub mod validation;

pub use config::{DistributedThrottlerConfig, NodeConfig, ThrottlerMode, ThroughputThrottlerConfig};
pub use discovery::{DiscoveryClient, InMemoryDiscovery, MemberClient};
pub use error::{Error, ErrorCode, Result};
pub use factory::{DistributedThrottlerFactory, FactoryOptions};
pub use proxy::ChannelFactory;
pub use server::RpcServer;
pub use throttler::{ReconfigurableThroughputThrottler, ThroughputThrottler, WrappedThrottler};
