use anyhow::{Context, Result};
use clap::Parser;
use distributed_throttler::config::NodeConfig;
use distributed_throttler::redis::{RedisClient, RedisDiscoveryClient, RedisMemberClient};
use distributed_throttler::server::shutdown_signal;
use distributed_throttler::{ChannelFactory, DistributedThrottlerFactory, FactoryOptions, RpcServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Member of a distributed throttling group.
#[derive(Debug, Parser)]
#[command(name = "distributed-throttler", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "THROTTLER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "THROTTLER_BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// Address advertised to other members
    #[arg(long, env = "THROTTLER_ADDRESS")]
    address: Option<String>,

    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "THROTTLER_GROUP_ID")]
    group_id: Option<String>,

    #[arg(long, env = "THROTTLER_MEMBER_ID")]
    member_id: Option<String>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };

        if let Some(bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr;
        }
        if self.address.is_some() {
            config.advertised_address = self.address;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if let Some(group_id) = self.group_id {
            config.group_id = group_id;
        }
        if self.member_id.is_some() {
            config.member_id = self.member_id;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }

        config.validate_all()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Args::parse()
        .into_config()
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("distributed_throttler={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let member_id = config
        .member_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let address = config.advertised_address();

    tracing::info!("Starting distributed throttler node");
    tracing::info!(
        "Configuration: bind_addr={}, address={}, group_id={}, member_id={}, mode={}",
        config.bind_addr,
        address,
        config.group_id,
        member_id,
        config.distributed.mode
    );

    let redis = RedisClient::new(&config.redis_url)?;
    redis
        .ping(config.distributed.discovery_client.read_timeout)
        .await
        .context("Redis is not reachable")?;

    let key_prefix = config.distributed.discovery_client.key_prefix.clone();
    let discovery = Arc::new(RedisDiscoveryClient::new(
        redis.clone(),
        config.distributed.discovery_client.clone(),
    ));
    let member_client = RedisMemberClient::new(
        redis,
        &key_prefix,
        &config.group_id,
        &member_id,
        config.distributed.member_client.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    let rpc_server = RpcServer::new(config.rpc.clone());

    let factory = DistributedThrottlerFactory::new(
        config.distributed.clone(),
        FactoryOptions {
            group_id: config.group_id.clone(),
            member_id,
            address,
            channel_factory: ChannelFactory::new()?,
            discovery,
            member_client,
            rpc_server: rpc_server.clone(),
        },
    )?;

    let mut throttlers = Vec::with_capacity(config.throttlers.len());
    for (throttler_id, throttler_config) in &config.throttlers {
        throttlers.push(factory.get_or_create_throttler(throttler_id, throttler_config.clone(), None)?);
    }

    factory.start().await?;
    let served = rpc_server.serve(listener, shutdown_signal()).await;
    factory.stop().await;
    drop(throttlers);

    served.context("RPC server error")?;
    tracing::info!("Distributed throttler node stopped");
    Ok(())
}
