//! The wall-clock second, cached off the admission path.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the cached second is refreshed from the system clock.
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

/// Source of the current wall-clock second.
///
/// Every algorithm in this crate is keyed on integer seconds; nothing else
/// reads time. Implementations must advance monotonically.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// System clock with a cached second.
///
/// Reading the cache is a relaxed atomic load, so the admission path never
/// pays for a syscall. The cache is advanced by a background tick; `fetch_max`
/// keeps the visible second monotonic even if the system clock steps back.
pub struct SystemClock {
    cached: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            cached: AtomicI64::new(wall_second()),
        }
    }

    /// Spawn the background refresh tick. Runs until `shutdown` fires.
    pub fn spawn_refresh(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.cached.fetch_max(wall_second(), Ordering::Relaxed);
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("clock refresh stopping");
                        break;
                    }
                }
            }
        })
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.cached.load(Ordering::Relaxed)
    }
}

fn wall_second() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Hand-driven clock for deterministic tests.
pub struct ManualClock {
    second: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            second: AtomicI64::new(start),
        }
    }

    pub fn set(&self, second: i64) {
        self.second.store(second, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.second.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.second.load(Ordering::SeqCst)
    }
}
