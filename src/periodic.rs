use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type Callback = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// Runs a callback on the tokio runtime every `period`.
///
/// The first run happens right after [`PeriodicExecutor::start`]. Iterations
/// never overlap, and [`PeriodicExecutor::stop`] waits for the running one.
pub struct PeriodicExecutor {
    name: &'static str,
    callback: Callback,
    period: watch::Sender<Duration>,
    out_of_band: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicExecutor {
    pub fn new(name: &'static str, period: Duration, callback: Callback) -> Self {
        let (period, _) = watch::channel(period);
        Self {
            name,
            callback,
            period,
            out_of_band: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Must be called from within a tokio runtime. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let mut period_rx = self.period.subscribe();
        let out_of_band = self.out_of_band.clone();
        let callback = self.callback.clone();
        let name = self.name;

        let handle = tokio::spawn(async move {
            debug!(executor = name, "Periodic executor started");
            loop {
                callback().await;

                let period = *period_rx.borrow_and_update();
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = tokio::time::sleep(period) => {}
                    _ = out_of_band.notified() => {}
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(executor = name, "Periodic executor stopped");
        });

        *running = Some(Running { stop: stop_tx, handle });
    }

    /// Stop the loop, waiting for the current iteration to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.stop.send(());
        if let Err(e) = running.handle.await {
            if e.is_panic() {
                warn!(executor = self.name, error = %e, "Periodic executor panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Takes effect after the current wait.
    pub fn set_period(&self, period: Duration) {
        self.period.send_replace(period);
    }

    pub fn period(&self) -> Duration {
        *self.period.borrow()
    }

    /// Run the callback as soon as the current wait can be interrupted.
    pub fn schedule_out_of_band(&self) {
        self.out_of_band.notify_one();
    }
}

impl Drop for PeriodicExecutor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.handle.abort();
        }
    }
}
