use axum::{extract::State, http::HeaderMap, Json};
use std::sync::Arc;
use tracing::trace;

use crate::error::Result;
use crate::messages::{HealthResponse, HeartbeatRequest, HeartbeatResponse, ThrottleRequest, ThrottleResponse};
use crate::middleware::request_realm;
use crate::server::RpcServer;
use crate::throttler::ThroughputThrottler;
use crate::validation::{validate_heartbeat, validate_throttle};

/// Follower heartbeat: usage in, limits out.
pub async fn heartbeat(
    State(server): State<Arc<RpcServer>>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>> {
    validate_heartbeat(&request)?;
    let service = server.find_service(request_realm(&headers))?;
    Ok(Json(service.heartbeat(request)?))
}

/// Precise-mode admission. Once the throttler is resolved the request holds
/// a queue slot until it is admitted or the caller goes away.
pub async fn throttle(
    State(server): State<Arc<RpcServer>>,
    headers: HeaderMap,
    Json(request): Json<ThrottleRequest>,
) -> Result<Json<ThrottleResponse>> {
    validate_throttle(&request)?;
    let service = server.find_service(request_realm(&headers))?;
    let throttler = service.find_throttler(&request.throttler_id)?;

    let _slot = server.throttle_queue().acquire().await?;
    trace!(throttler_id = %request.throttler_id, count = request.count, "Throttling on behalf of a member");
    ThroughputThrottler::throttle(throttler.as_ref(), request.count).await?;
    Ok(Json(ThrottleResponse {}))
}

pub async fn health_check(State(server): State<Arc<RpcServer>>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(
        server.registered_realm().map(|realm| realm.to_string()),
    ))
}
