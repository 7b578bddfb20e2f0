//! Per-resource limiter: the slot ring, carry-over, store reconciliation and
//! weight refresh.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use flowgate_store::{Pipeline, Reply};

use crate::random::RandomSource;
use crate::slot::Slot;

/// Ceiling on carried-over budget, as a multiple of the per-second target.
/// Applied on the first slot roll after each weight refresh so an idle
/// instance cannot stockpile unbounded credit.
const MAX_CARRY_MULTIPLE: f64 = 8.0;

/// Seconds to wait before publishing a slot's local count. The slot must be
/// quiescent: a request stamped into second `t-1` can still be executing at
/// wall time `t`.
const UPLOAD_LAG_SECS: i64 = 2;

/// Seconds to wait before reading a slot's cluster count back. Covers every
/// other instance's upload lag plus propagation.
const DOWNLOAD_LAG_SECS: i64 = 5;

/// TTL for per-second cluster counters in the store.
const COUNTER_TTL_SECS: u64 = 3600;

/// Store key for the cluster counter of `resource_key` at `second`.
pub fn counter_key(resource_key: &str, second: i64) -> String {
    format!("rate-limiter:request:{resource_key}:{second}")
}

/// f64 in an atomic cell. Plain get/set is all the single-writer fields on
/// the limiter need.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Handle for applying a downloaded cluster count after the pipeline flush.
#[derive(Debug, Clone, Copy)]
pub struct DownloadTicket {
    second: i64,
    reply_index: usize,
}

impl DownloadTicket {
    pub fn reply_index(&self) -> usize {
        self.reply_index
    }
}

/// Rate limiter state for one resource key.
///
/// Owns a ring of one-second [`Slot`]s. Admission rolls the ring forward
/// locally; the syncer reconciles slots with the cluster through the store
/// and periodically recomputes this instance's traffic-share weight.
pub struct Limiter {
    resource_key: String,
    window_size: u64,
    window: Vec<Slot>,
    /// Second of the most recent roll check. The first caller to swap a new
    /// second in wins the roll election.
    last_acquire_second: AtomicI64,
    /// Set by `refresh`, consumed by the next roll to clamp carry-over.
    refreshed: AtomicBool,
    /// This instance's share of observed cluster traffic, in (0, 1].
    weight: AtomicF64,
    /// Budget left over from the previous second.
    remain: AtomicF64,
    /// Most recent per-call QPS target, kept for the verbose log line.
    qps: AtomicF64,
    log_enabled: bool,
    random: Arc<dyn RandomSource>,
}

impl Limiter {
    pub fn new(
        resource_key: String,
        window_size: u64,
        log_enabled: bool,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let window = (0..window_size).map(|_| Slot::new()).collect();
        Self {
            resource_key,
            window_size,
            window,
            last_acquire_second: AtomicI64::new(0),
            refreshed: AtomicBool::new(false),
            weight: AtomicF64::new(1.0),
            remain: AtomicF64::new(0.0),
            qps: AtomicF64::new(0.0),
            log_enabled,
            random,
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn window_size(&self) -> u64 {
        self.window_size
    }

    pub fn weight(&self) -> f64 {
        self.weight.load()
    }

    /// The most recent cluster QPS target passed to `try_acquire`.
    pub fn qps(&self) -> f64 {
        self.qps.load()
    }

    fn slot_at(&self, second: i64) -> &Slot {
        let index = second.rem_euclid(self.window_size as i64) as usize;
        &self.window[index]
    }

    /// Return the slot for `now`, rolling it if this call is the first of a
    /// new second.
    ///
    /// The election uses a swap on `last_acquire_second`: whoever swaps the
    /// new second in first re-initializes the slot and assigns its limit, so
    /// `Slot::init` runs at most once per second.
    fn current_slot(&self, now: i64, qps: f64) -> &Slot {
        let slot = self.slot_at(now);
        if self.last_acquire_second.swap(now, Ordering::AcqRel) == now {
            return slot;
        }

        slot.init(now);

        let weight = self.weight.load();
        let mut remain = self.remain.load();
        if self.refreshed.swap(false, Ordering::AcqRel) {
            // A weight refresh happened during the previous window; cap
            // whatever credit built up since the last roll.
            remain = remain.min(qps * weight * MAX_CARRY_MULTIPLE);
            self.remain.store(remain);
        }

        let limit = qps * weight + remain;
        slot.set_limit(limit);

        if self.log_enabled {
            tracing::debug!(
                resource = %self.resource_key,
                second = now,
                qps,
                limit,
                weight,
                remain,
                "rolled slot"
            );
        }
        slot
    }

    /// Admission decision for one request against the current second.
    ///
    /// Whatever budget the call leaves unused is recorded so the next
    /// second's slot can inherit it.
    pub fn try_acquire(&self, now: i64, qps: f64) -> bool {
        self.qps.store(qps);
        let slot = self.current_slot(now, qps);
        let granted = slot.try_acquire_token(self.random.as_ref());
        self.remain.store(slot.remain());
        granted
    }

    /// Stage this limiter's store traffic for the tick at `now`.
    ///
    /// Uploads the local attempt count of the slot `UPLOAD_LAG_SECS` back
    /// (skipped when that slot is stale or was never used), and stages a read
    /// of the cluster counter `DOWNLOAD_LAG_SECS` back. Attempts rather than
    /// grants are published: the weight derived from these counters tracks
    /// each instance's share of demand.
    pub fn stage_sync(&self, now: i64, pipe: &mut Pipeline) -> DownloadTicket {
        let upload_second = now - UPLOAD_LAG_SECS;
        let upload_slot = self.slot_at(upload_second);
        if !upload_slot.is_instance_expired(upload_second, self.window_size) {
            let key = counter_key(&self.resource_key, upload_second);
            let count = upload_slot.snapshot().instance_request_count;
            pipe.incr_by(key.clone(), count);
            pipe.expire(key, COUNTER_TTL_SECS);
        }

        let download_second = now - DOWNLOAD_LAG_SECS;
        let reply_index = pipe.get(counter_key(&self.resource_key, download_second));
        DownloadTicket {
            second: download_second,
            reply_index,
        }
    }

    /// Apply a downloaded cluster counter to its slot.
    ///
    /// A missing key reads as zero. A malformed value is logged and the slot
    /// keeps its previous cluster data, which the next refresh will treat as
    /// expired.
    pub fn apply_download(&self, ticket: &DownloadTicket, reply: &Reply) {
        let count = match reply {
            Reply::Nil => 0,
            Reply::Int(value) if *value >= 0 => *value as u64,
            Reply::Bulk(raw) => match raw.parse::<u64>() {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(
                        resource = %self.resource_key,
                        second = ticket.second,
                        raw,
                        %error,
                        "unparseable cluster counter"
                    );
                    return;
                }
            },
            other => {
                tracing::warn!(
                    resource = %self.resource_key,
                    second = ticket.second,
                    ?other,
                    "unexpected cluster counter reply"
                );
                return;
            }
        };

        let slot = self.slot_at(ticket.second);
        slot.set_cluster_request_count(count);
        slot.set_cluster_time(ticket.second);
    }

    /// Recompute this instance's traffic-share weight. Called by the syncer
    /// on window-aligned seconds only.
    ///
    /// Sums local attempts and cluster counts over the ring positions for
    /// `now+1 .. now+W-1` (exclusive), keeping only slots whose cluster data
    /// is fresh against `now-1`. The scan bounds skip the current slot and
    /// one neighbor; tests pin this so the bounds cannot drift silently.
    pub fn refresh(&self, now: i64) {
        self.refreshed.store(true, Ordering::Release);

        let mut cluster_total: u64 = 0;
        let mut local_total: u64 = 0;
        for second in (now + 1)..(now + self.window_size as i64 - 1) {
            let slot = self.slot_at(second);
            if slot.is_cluster_expired(now - 1, self.window_size) {
                continue;
            }
            let view = slot.snapshot();
            cluster_total += view.cluster_request_count;
            local_total += view.instance_request_count;
        }

        // An instance with no observed share starts over at full weight; it
        // is harmless because it also has no traffic to admit.
        let weight = if cluster_total == 0 || local_total == 0 {
            1.0
        } else {
            (local_total as f64 / cluster_total as f64).min(1.0)
        };
        self.weight.store(weight);

        if self.log_enabled {
            tracing::debug!(
                resource = %self.resource_key,
                second = now,
                weight,
                local_total,
                cluster_total,
                "refreshed weight"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_view(&self, second: i64) -> crate::slot::SlotView {
        self.slot_at(second).snapshot()
    }
}
