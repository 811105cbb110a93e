//! Client side of the distributed throttler RPC.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, ErrorResponse, Result};
use crate::messages::{HeartbeatRequest, HeartbeatResponse, ThrottleRequest, ThrottleResponse};

pub const REALM_HEADER: &str = "x-realm-id";
pub const HEARTBEAT_PATH: &str = "/distributed_throttler/heartbeat";
pub const THROTTLE_PATH: &str = "/distributed_throttler/throttle";
pub const HEALTH_PATH: &str = "/health";

/// Creates channels to other members, sharing one connection pool.
#[derive(Debug, Clone)]
pub struct ChannelFactory {
    client: reqwest::Client,
}

impl ChannelFactory {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn create_channel(&self, address: &str, realm_id: Uuid) -> LeaderChannel {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        LeaderChannel {
            client: self.client.clone(),
            address: address.to_string(),
            base_url,
            realm_id,
        }
    }
}

/// Connection to the service of one realm at one address.
#[derive(Debug, Clone)]
pub struct LeaderChannel {
    client: reqwest::Client,
    address: String,
    base_url: String,
    realm_id: Uuid,
}

impl LeaderChannel {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn realm_id(&self) -> Uuid {
        self.realm_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

pub struct DistributedThrottlerProxy {
    channel: LeaderChannel,
}

impl DistributedThrottlerProxy {
    pub fn new(channel: LeaderChannel) -> Self {
        Self { channel }
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest, timeout: Duration) -> Result<HeartbeatResponse> {
        self.invoke(HEARTBEAT_PATH, request, timeout).await
    }

    /// Resolves once the leader admits the request. Dropping the future
    /// aborts the call and frees its slot on the leader.
    pub async fn throttle(&self, request: &ThrottleRequest, timeout: Duration) -> Result<()> {
        let _: ThrottleResponse = self.invoke(THROTTLE_PATH, request, timeout).await?;
        Ok(())
    }

    async fn invoke<Req, Rsp>(&self, path: &str, request: &Req, timeout: Duration) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let response = self
            .channel
            .client
            .post(self.channel.url(path))
            .header(REALM_HEADER, self.channel.realm_id.to_string())
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response.json::<Rsp>().await?);
        }

        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => Err(body.into_error()),
            Err(_) => Err(Error::Internal(format!(
                "Unexpected response status {} from {}",
                status, self.channel.address
            ))),
        }
    }
}
