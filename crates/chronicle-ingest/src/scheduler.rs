//! Cancellable periodic task scheduling.
//!
//! All background loops (flush tick, voice sampler, health checks,
//! maintenance) share one shutdown signal and the same spawn shape, so
//! shutdown ordering lives in one place instead of per-task ad hoc flags.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Broadcast shutdown signal shared by every background task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// The sending half, held by the process entry point.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle { tx }, Shutdown { rx })
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested.
    pub async fn triggered(&mut self) {
        // Already-triggered channels resolve immediately via the marker.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Sender dropped; treat as shutdown.
                return;
            }
        }
    }
}

impl ShutdownHandle {
    /// Request shutdown of every task holding a [`Shutdown`].
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Spawn a task that runs `work` every `interval` until shutdown.
///
/// The first run happens after one full interval, not immediately. The task
/// exits promptly when shutdown fires, even mid-wait.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: Shutdown,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Consume the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    work().await;
                }
                _ = shutdown.triggered() => {
                    tracing::debug!(task = name, "periodic task stopping");
                    return;
                }
            }
        }
    })
}
