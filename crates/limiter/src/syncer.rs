//! The background reconciliation task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flowgate_common::LimiterSettings;
use flowgate_store::{Pipeline, Store, StoreError};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::limiter::{DownloadTicket, Limiter};
use crate::registry::LimiterRegistry;

/// Polling period. Work is collapsed to once per wall-clock second; the poll
/// only bounds how late into a second that work can start.
pub const SYNC_INTERVAL: Duration = Duration::from_millis(200);

/// One process-wide task that reconciles every limiter with the store.
///
/// Each effective tick uploads recently-finalized slot counts, reads back
/// cluster totals for older slots in the same pipeline flush, and triggers a
/// weight refresh on window-aligned seconds. Store failures cost one tick of
/// freshness and nothing else.
pub struct Syncer {
    registry: Arc<LimiterRegistry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: Arc<ArcSwap<LimiterSettings>>,
    previous_sync_second: AtomicI64,
}

impl Syncer {
    pub fn new(
        registry: Arc<LimiterRegistry>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        settings: Arc<ArcSwap<LimiterSettings>>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            settings,
            previous_sync_second: AtomicI64::new(0),
        }
    }

    /// Run until `shutdown` fires. A failed tick is logged and the loop keeps
    /// going; this task must never die.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("syncer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!(%error, "sync tick failed, keeping last known state");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("syncer shutting down");
                    break;
                }
            }
        }
    }

    /// One polling tick. Returns without work unless the second advanced
    /// since the last effective tick.
    pub async fn tick(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        if self.previous_sync_second.swap(now, Ordering::AcqRel) == now {
            return Ok(());
        }

        let window_size = self.settings.load().window_size;
        let limiters = self.registry.limiters();

        if now % window_size as i64 == 0 {
            for limiter in &limiters {
                limiter.refresh(now);
            }
        }

        if limiters.is_empty() {
            return Ok(());
        }

        let mut pipe = Pipeline::new();
        let tickets: Vec<(Arc<Limiter>, DownloadTicket)> = limiters
            .iter()
            .map(|limiter| (Arc::clone(limiter), limiter.stage_sync(now, &mut pipe)))
            .collect();

        let replies = self.store.execute(pipe).await?;

        for (limiter, ticket) in tickets {
            match replies.get(ticket.reply_index()) {
                Some(reply) => limiter.apply_download(&ticket, reply),
                None => tracing::warn!(
                    resource = limiter.resource_key(),
                    "pipeline reply missing for download"
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::random::FixedRandom;
    use flowgate_store::MemoryStore;
    use std::collections::HashSet;

    struct Fixture {
        syncer: Syncer,
        registry: Arc<LimiterRegistry>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        settings: Arc<ArcSwap<LimiterSettings>>,
    }

    fn fixture(start_second: i64) -> Fixture {
        let registry = Arc::new(LimiterRegistry::new(Arc::new(FixedRandom(0.999))));
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_second));
        let settings = Arc::new(ArcSwap::from_pointee(LimiterSettings {
            enabled: true,
            window_size: 30,
            log_resource_keys: HashSet::new(),
        }));
        let syncer = Syncer::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&settings),
        );
        Fixture {
            syncer,
            registry,
            store,
            clock,
            settings,
        }
    }

    #[tokio::test]
    async fn collapses_ticks_within_one_second() {
        let f = fixture(1000);
        let limiter = f
            .registry
            .get("search", &f.settings.load());
        for _ in 0..10 {
            limiter.try_acquire(f.clock.now(), 100.0);
        }

        f.clock.set(1002);
        f.syncer.tick().await.unwrap();
        assert_eq!(f.store.get_int("rate-limiter:request:search:1000"), Some(10));

        // Same second again: no second upload.
        for _ in 0..5 {
            limiter.try_acquire(1000, 100.0);
        }
        f.syncer.tick().await.unwrap();
        assert_eq!(f.store.get_int("rate-limiter:request:search:1000"), Some(10));

        // Next second: the upload offset has moved past 1000, and second 1001
        // saw no traffic, so nothing new is published.
        f.clock.set(1003);
        f.syncer.tick().await.unwrap();
        assert_eq!(f.store.get_int("rate-limiter:request:search:1001"), None);
    }

    #[tokio::test]
    async fn download_feeds_cluster_counter_back() {
        let f = fixture(1000);
        let limiter = f.registry.get("search", &f.settings.load());
        limiter.try_acquire(1000, 100.0);

        // Publish second 1000 at tick 1002, read it back at tick 1005.
        f.clock.set(1002);
        f.syncer.tick().await.unwrap();
        f.clock.set(1005);
        f.syncer.tick().await.unwrap();

        let view = limiter.slot_view(1000);
        assert_eq!(view.cluster_time, 1000);
        assert_eq!(view.cluster_request_count, 1);
    }

    #[tokio::test]
    async fn refreshes_on_window_aligned_seconds() {
        let f = fixture(1000);
        let limiter = f.registry.get("search", &f.settings.load());

        // Give one in-window slot fresh cluster data so refresh has a ratio
        // to compute: 20 local attempts against a cluster total of 80.
        for _ in 0..20 {
            limiter.try_acquire(1013, 100.0);
        }
        f.clock.set(1015);
        f.syncer.tick().await.unwrap();
        let mut pipe = Pipeline::new();
        pipe.incr_by("rate-limiter:request:search:1013".to_string(), 60);
        f.store.execute(pipe).await.unwrap();
        f.clock.set(1018);
        f.syncer.tick().await.unwrap();
        assert_eq!(limiter.slot_view(1013).cluster_request_count, 80);

        // 1019 is not aligned: weight untouched.
        f.clock.set(1019);
        f.syncer.tick().await.unwrap();
        assert_eq!(limiter.weight(), 1.0);

        // 1020 % 30 == 0: refresh runs.
        f.clock.set(1020);
        f.syncer.tick().await.unwrap();
        assert!((limiter.weight() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn store_outage_fails_tick_but_not_state() {
        let f = fixture(1000);
        let limiter = f.registry.get("search", &f.settings.load());
        limiter.try_acquire(1000, 100.0);

        f.store.set_available(false);
        f.clock.set(1002);
        assert!(f.syncer.tick().await.is_err());

        // Admission keeps working on local state.
        assert!(limiter.try_acquire(1002, 100.0));

        f.store.set_available(true);
        f.clock.set(1003);
        f.syncer.tick().await.unwrap();
        assert_eq!(f.store.get_int("rate-limiter:request:search:1001"), None);
        assert_eq!(f.store.get_int("rate-limiter:request:search:1002"), None);
    }

    #[tokio::test]
    async fn no_store_traffic_without_limiters() {
        let f = fixture(1000);
        f.clock.set(1001);
        // Store offline, but an empty registry never reaches it.
        f.store.set_available(false);
        assert!(f.syncer.tick().await.is_ok());
    }
}
