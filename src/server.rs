use axum::routing::{get, post};
use axum::{middleware, Router};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RpcServerConfig;
use crate::error::{Error, Result};
use crate::handlers::{health_check, heartbeat, throttle};
use crate::middleware::logging_middleware;
use crate::proxy::{HEALTH_PATH, HEARTBEAT_PATH, THROTTLE_PATH};
use crate::service::DistributedThrottlerService;

const SERVICE_NAME: &str = "DistributedThrottlerService";

/// Bounds the number of `Throttle` calls running and waiting at once.
#[derive(Debug)]
pub struct RequestQueue {
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    concurrency_limit: usize,
    queue_size_limit: usize,
}

/// Held for the lifetime of an admitted request; dropping it frees the slot.
#[derive(Debug)]
pub struct RequestSlot {
    _permit: OwnedSemaphorePermit,
    _pending: PendingGuard,
}

#[derive(Debug)]
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestQueue {
    pub fn new(concurrency_limit: usize, queue_size_limit: usize) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            pending: Arc::new(AtomicUsize::new(0)),
            concurrency_limit,
            queue_size_limit,
        }
    }

    /// Wait for a running slot, or fail at once if the queue is full.
    pub async fn acquire(&self) -> Result<RequestSlot> {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = PendingGuard(self.pending.clone());
        if pending > self.concurrency_limit + self.queue_size_limit {
            return Err(Error::RequestQueueSizeLimitExceeded {
                limit: self.queue_size_limit,
            });
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("Request queue is closed".to_string()))?;

        Ok(RequestSlot {
            _permit: permit,
            _pending: guard,
        })
    }

    /// Requests running or waiting.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// HTTP endpoint of a member.
///
/// Always serves `/health`; the throttler methods answer only while a
/// service is registered, that is while this member leads its group.
pub struct RpcServer {
    service: RwLock<Option<Arc<DistributedThrottlerService>>>,
    throttle_queue: RequestQueue,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig) -> Arc<Self> {
        Arc::new(Self {
            service: RwLock::new(None),
            throttle_queue: RequestQueue::new(config.throttle_concurrency_limit, config.throttle_queue_size_limit),
        })
    }

    pub fn register_service(&self, service: Arc<DistributedThrottlerService>) {
        debug!(realm_id = %service.realm_id(), "Service registered");
        *self.service.write() = Some(service);
    }

    /// Unregister the service of `realm_id`; a service of another realm stays.
    pub fn unregister_service(&self, realm_id: Uuid) {
        let mut service = self.service.write();
        if service.as_ref().is_some_and(|s| s.realm_id() == realm_id) {
            *service = None;
            debug!(realm_id = %realm_id, "Service unregistered");
        }
    }

    /// Registered service, checked against the realm the caller addressed.
    pub fn find_service(&self, realm_id: Option<Uuid>) -> Result<Arc<DistributedThrottlerService>> {
        let service = self.service.read().clone();
        match service {
            Some(service) if realm_id.map_or(true, |realm| realm == service.realm_id()) => Ok(service),
            _ => Err(Error::NoSuchService {
                service: SERVICE_NAME.to_string(),
            }),
        }
    }

    pub fn registered_realm(&self) -> Option<Uuid> {
        self.service.read().as_ref().map(|service| service.realm_id())
    }

    pub fn throttle_queue(&self) -> &RequestQueue {
        &self.throttle_queue
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(HEARTBEAT_PATH, post(heartbeat))
            .route(THROTTLE_PATH, post(throttle))
            .route(HEALTH_PATH, get(health_check))
            .with_state(self.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn(logging_middleware)),
            )
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("RPC server listening on {}", addr);
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
