//! Connection supervision and retry with exponential backoff.
//!
//! The supervisor owns liveness for both storage media: the Postgres store
//! and the SQLite journal. It probes each on a fixed schedule, publishes the
//! result as gauges, and drives reconnection attempts through the shared
//! backoff helper.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;
use crate::journal::Journal;
use crate::scheduler::Shutdown;
use crate::store::PersistentStore;

/// Interval between health probes.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffConfig {
    /// Delay before attempt `attempt` (0-based). Saturates at `cap`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Retry `op` with exponential backoff until it succeeds or shutdown fires.
///
/// Returns `None` only when shutdown interrupts the wait.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &'static str,
    config: BackoffConfig,
    mut shutdown: Shutdown,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(what, attempt, "operation succeeded after retries");
                }
                return Some(value);
            }
            Err(e) => {
                let delay = config.delay(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "operation failed, backing off: {}",
                    e
                );
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.triggered() => return None,
                }
            }
        }
    }
}

/// Cheap shared liveness flags, published by the supervisor and consulted
/// on the hot enqueue path. While the journal flag is down the gateway
/// bypasses buffering and writes straight through the fallback.
#[derive(Clone)]
pub struct MediaHealth {
    store: Arc<AtomicBool>,
    journal: Arc<AtomicBool>,
}

impl MediaHealth {
    /// Both media start out presumed healthy; the first probe corrects that.
    pub fn new() -> Self {
        Self {
            store: Arc::new(AtomicBool::new(true)),
            journal: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn store_ok(&self) -> bool {
        self.store.load(Ordering::Relaxed)
    }

    pub fn journal_ok(&self) -> bool {
        self.journal.load(Ordering::Relaxed)
    }

    pub(crate) fn set_store(&self, ok: bool) {
        self.store.store(ok, Ordering::Relaxed);
    }

    pub(crate) fn set_journal(&self, ok: bool) {
        self.journal.store(ok, Ordering::Relaxed);
    }
}

impl Default for MediaHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the health of the store and journal.
pub struct ConnectionSupervisor {
    store: PersistentStore,
    journal: Arc<Journal>,
    store_state: Mutex<ConnState>,
    journal_state: Mutex<ConnState>,
    health: MediaHealth,
}

impl ConnectionSupervisor {
    pub fn new(store: PersistentStore, journal: Arc<Journal>) -> Self {
        Self {
            store,
            journal,
            store_state: Mutex::new(ConnState::Connected),
            journal_state: Mutex::new(ConnState::Connected),
            health: MediaHealth::new(),
        }
    }

    /// Handle to the liveness flags this supervisor maintains.
    pub fn health(&self) -> MediaHealth {
        self.health.clone()
    }

    pub fn store_state(&self) -> ConnState {
        *self.store_state.lock()
    }

    pub fn journal_state(&self) -> ConnState {
        *self.journal_state.lock()
    }

    /// Both media healthy.
    pub fn is_healthy(&self) -> bool {
        self.store_state() == ConnState::Connected
            && self.journal_state() == ConnState::Connected
    }

    /// One probe round against both media.
    pub async fn check_once(&self) {
        let started = Instant::now();

        let store_ok = self.store.ping().await.is_ok();
        self.transition(&self.store_state, "store", store_ok);
        self.health.set_store(store_ok);
        metrics::gauge!("store_connected").set(if store_ok { 1.0 } else { 0.0 });

        let journal_ok = self.journal.ping().is_ok();
        self.transition(&self.journal_state, "journal", journal_ok);
        self.health.set_journal(journal_ok);
        metrics::gauge!("journal_connected").set(if journal_ok { 1.0 } else { 0.0 });

        metrics::histogram!("store_health_check_duration_seconds")
            .record(started.elapsed().as_secs_f64());
    }

    fn transition(&self, state: &Mutex<ConnState>, medium: &'static str, ok: bool) {
        let mut state = state.lock();
        let next = if ok {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        };
        if *state != next {
            tracing::warn!(medium, from = state.as_str(), to = next.as_str(), "health transition");
            if next == ConnState::Disconnected {
                metrics::counter!("store_reconnect_attempts_total").increment(1);
            }
        }
        *state = next;
    }

    /// Reconnect-wait helper: blocks until the store answers a probe again,
    /// backing off between attempts.
    pub async fn await_store(&self, shutdown: Shutdown) -> bool {
        *self.store_state.lock() = ConnState::Connecting;
        let store = self.store.clone();
        let reconnected = retry_with_backoff(
            "store-reconnect",
            BackoffConfig::default(),
            shutdown,
            move || {
                let store = store.clone();
                async move { store.ping().await }
            },
        )
        .await
        .is_some();
        self.health.set_store(reconnected);
        metrics::gauge!("store_connected").set(if reconnected { 1.0 } else { 0.0 });
        *self.store_state.lock() = if reconnected {
            ConnState::Connected
        } else {
            ConnState::Disconnected
        };
        reconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay(0), Duration::from_secs(1));
        assert_eq!(config.delay(1), Duration::from_secs(2));
        assert_eq!(config.delay(2), Duration::from_secs(4));
        assert_eq!(config.delay(8), Duration::from_secs(256));
        // Beyond the cap everything is 300s.
        assert_eq!(config.delay(9), Duration::from_secs(300));
        assert_eq!(config.delay(30), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let (_handle, shutdown) = Shutdown::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();

        let result = retry_with_backoff(
            "test",
            BackoffConfig {
                base: Duration::from_millis(10),
                factor: 2.0,
                cap: Duration::from_millis(100),
            },
            shutdown,
            move || {
                let attempts = attempts2.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(crate::error::Error::Config("not yet".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_aborts_on_shutdown() {
        let (handle, shutdown) = Shutdown::new();
        handle.trigger();

        let result: Option<()> = retry_with_backoff(
            "test",
            BackoffConfig::default(),
            shutdown,
            || async { Err(crate::error::Error::Config("always".to_string())) },
        )
        .await;

        assert_eq!(result, None);
    }

    #[test]
    fn test_media_health_starts_healthy_and_flips() {
        let health = MediaHealth::new();
        assert!(health.store_ok());
        assert!(health.journal_ok());

        let shared = health.clone();
        shared.set_journal(false);
        // Clones share state: the gateway's handle sees the transition.
        assert!(!health.journal_ok());
        assert!(health.store_ok());
    }

    #[test]
    fn test_conn_state_labels() {
        assert_eq!(ConnState::Connected.as_str(), "connected");
        assert_eq!(ConnState::Connecting.as_str(), "connecting");
        assert_eq!(ConnState::Disconnected.as_str(), "disconnected");
    }
}
