//! Fleet-wide request-rate limiting for flowgate.
//!
//! Every process admits or denies requests locally -- the hot path is a few
//! atomic reads and one mutex-guarded counter update, with no store
//! round-trip. A single background [`Syncer`] publishes each resource's
//! per-second demand to the coordination store, reads back cluster totals,
//! and periodically rebalances each instance's share of the configured
//! cluster-wide QPS target in proportion to its observed traffic.
//!
//! The limiter is an advisory shaper, not a safety gate: when disabled or
//! when the store is unreachable it degrades toward admitting traffic,
//! never toward failing calls.

pub mod clock;
pub mod limiter;
pub mod metrics;
pub mod random;
pub mod registry;
pub mod slot;
pub mod syncer;

use std::sync::Arc;

use arc_swap::ArcSwap;
use flowgate_common::{AppConfig, FlowgateError, FlowgateResult, LimiterConfig, LimiterSettings};
use flowgate_store::{RedisStore, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{counter_key, Limiter};
pub use metrics::AdmissionMetrics;
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use registry::LimiterRegistry;
pub use syncer::Syncer;

/// The process-wide rate limiter.
///
/// Cheap to share behind an `Arc`; call [`try_acquire`](Self::try_acquire)
/// on every request and [`spawn`](Self::spawn) once at startup to launch the
/// background reconciliation.
pub struct RateLimiter {
    registry: Arc<LimiterRegistry>,
    settings: Arc<ArcSwap<LimiterSettings>>,
    clock: Arc<dyn Clock>,
    metrics: AdmissionMetrics,
    syncer: Arc<Syncer>,
    system_clock: Option<Arc<SystemClock>>,
}

impl RateLimiter {
    /// Connect the Redis-backed store from configuration and build the
    /// limiter around it.
    pub async fn connect(config: &AppConfig) -> FlowgateResult<Self> {
        let store = RedisStore::connect(&config.store.url, config.store.pool_size)
            .await
            .map_err(|error| FlowgateError::Store(error.to_string()))?;
        Ok(Self::new(&config.limiter, Arc::new(store)))
    }

    /// Production construction: system clock, thread-local randomness.
    pub fn new(config: &LimiterConfig, store: Arc<dyn Store>) -> Self {
        let system_clock = Arc::new(SystemClock::new());
        Self::assemble(
            LimiterSettings::from(config),
            store,
            Arc::clone(&system_clock) as Arc<dyn Clock>,
            Arc::new(ThreadRandom),
            Some(system_clock),
        )
    }

    /// Construction with injected clock and randomness, for deterministic
    /// tests and embedded setups.
    pub fn with_parts(
        settings: LimiterSettings,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self::assemble(settings, store, clock, random, None)
    }

    fn assemble(
        settings: LimiterSettings,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        system_clock: Option<Arc<SystemClock>>,
    ) -> Self {
        let registry = Arc::new(LimiterRegistry::new(random));
        let settings = Arc::new(ArcSwap::from_pointee(settings));
        let syncer = Arc::new(Syncer::new(
            Arc::clone(&registry),
            store,
            Arc::clone(&clock),
            Arc::clone(&settings),
        ));
        Self {
            registry,
            settings,
            clock,
            metrics: AdmissionMetrics::new(),
            syncer,
            system_clock,
        }
    }

    /// Admission decision for one request against `resource_key`.
    ///
    /// `qps` is the cluster-wide target for the key; this instance admits up
    /// to its current share of it. Returns `true` when the limiter is
    /// disabled (fail-open) or a token was granted.
    pub fn try_acquire(&self, resource_key: &str, qps: u64) -> bool {
        let settings = self.settings.load();
        if !settings.enabled {
            self.metrics.record(resource_key, false);
            return true;
        }

        let limiter = self.registry.get(resource_key, &settings);
        let granted = limiter.try_acquire(self.clock.now(), qps as f64);
        self.metrics.record(resource_key, !granted);
        granted
    }

    /// Publish new runtime settings. Takes effect on the next admission
    /// call; a changed window size rebuilds limiters lazily.
    pub fn apply_settings(&self, settings: LimiterSettings) {
        tracing::info!(
            enabled = settings.enabled,
            window_size = settings.window_size,
            "applying limiter settings"
        );
        self.settings.store(Arc::new(settings));
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &LimiterRegistry {
        &self.registry
    }

    /// The background syncer. Exposed so tests and embedded runtimes can
    /// drive ticks by hand instead of spawning the task.
    pub fn syncer(&self) -> Arc<Syncer> {
        Arc::clone(&self.syncer)
    }

    /// Launch the background work: the clock refresh (when running on the
    /// system clock) and the syncer. Tasks run until `shutdown` fires.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(system_clock) = &self.system_clock {
            handles.push(Arc::clone(system_clock).spawn_refresh(shutdown.clone()));
        }
        handles.push(tokio::spawn(Arc::clone(&self.syncer).run(shutdown)));
        handles
    }
}
