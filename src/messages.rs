//! Wire messages of the distributed throttler service.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerUsage {
    pub id: String,
    pub usage_rate: f64,
}

/// Follower to leader: current usage of every throttler the member holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub member_id: String,
    #[serde(default)]
    pub throttlers: Vec<ThrottlerUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerLimit {
    pub id: String,
    /// Absent when the throttler is unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
}

/// Leader to follower: limits for the throttlers the leader has an allocation for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub throttlers: Vec<ThrottlerLimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleRequest {
    pub throttler_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleResponse {}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the throttler service is registered, i.e. this member leads.
    pub service_registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_id: Option<String>,
}

impl HealthResponse {
    pub fn healthy(realm_id: Option<String>) -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            service_registered: realm_id.is_some(),
            realm_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_limit_is_omitted() {
        let response = HeartbeatResponse {
            throttlers: vec![
                ThrottlerLimit {
                    id: "a".to_string(),
                    limit: None,
                },
                ThrottlerLimit {
                    id: "b".to_string(),
                    limit: Some(12.5),
                },
            ],
        };

        let json = serde_json::to_value(&response).unwrap();
        assert!(json["throttlers"][0].get("limit").is_none());
        assert_eq!(json["throttlers"][1]["limit"], 12.5);
    }

    #[test]
    fn test_heartbeat_request_defaults() {
        let request: HeartbeatRequest = serde_json::from_str(r#"{"member_id": "m-1"}"#).unwrap();
        assert!(request.throttlers.is_empty());
    }
}
