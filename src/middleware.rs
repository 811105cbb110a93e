use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::proxy::REALM_HEADER;

/// Logs every RPC with the realm it was addressed to.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let realm = request_realm(request.headers()).map(|realm| realm.to_string());
    let started = Instant::now();

    debug!(
        target: "distributed_throttler::middleware",
        method = %method,
        uri = %uri,
        realm_id = realm.as_deref().unwrap_or("-"),
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(
            target: "distributed_throttler::middleware",
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "Request failed"
        );
    } else {
        debug!(
            target: "distributed_throttler::middleware",
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "Request completed"
        );
    }

    response
}

/// Realm the caller addressed; `None` if the header is absent or malformed.
pub fn request_realm(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(REALM_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}
