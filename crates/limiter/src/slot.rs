//! Per-second token accounting.

use std::sync::Mutex;

use crate::random::RandomSource;

/// Point-in-time copy of a slot's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotView {
    pub instance_time: i64,
    pub instance_request_count: u64,
    pub instance_released_count: u64,
    pub limit: f64,
    pub exhausted: bool,
    pub cluster_time: i64,
    pub cluster_request_count: u64,
}

/// Accounting record for one second of one resource on this instance.
///
/// A slot tracks attempts and grants observed locally plus the cluster-wide
/// count for the same second as last read from the store. All mutation goes
/// through the internal mutex; operations are O(1) and the lock is
/// uncontended in the common case of one active slot per resource.
///
/// `instance_time == 0` means the slot was never initialized; the same
/// sentinel applies to `cluster_time`.
pub struct Slot {
    state: Mutex<SlotView>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotView::default()),
        }
    }

    /// Reset the instance-side counters for a new second.
    ///
    /// `limit` and the cluster fields are left untouched; the owner assigns
    /// the limit right after the roll, and the cluster fields belong to the
    /// syncer.
    pub fn init(&self, second: i64) {
        let mut state = self.lock();
        state.exhausted = false;
        state.instance_request_count = 0;
        state.instance_released_count = 0;
        state.instance_time = second;
    }

    pub fn set_limit(&self, limit: f64) {
        self.lock().limit = limit;
    }

    /// Admission decision for one request.
    ///
    /// Attempts are always counted, granted or not; the attempt counter is
    /// what feeds the traffic-share weight, so it tracks demand rather than
    /// grants. The last token below a fractional limit is granted with
    /// probability equal to the fractional part, which makes the expected
    /// grant count for the slot equal the limit exactly. That decision
    /// latches: after it, every further attempt in this slot is denied.
    pub fn try_acquire_token(&self, random: &dyn RandomSource) -> bool {
        let mut state = self.lock();
        state.instance_request_count += 1;

        if state.exhausted {
            return false;
        }
        if state.instance_released_count as f64 > state.limit {
            // Counters can only get here if a caller bypassed the roll
            // protocol; deny rather than over-release.
            return false;
        }
        if (state.instance_released_count + 1) as f64 <= state.limit {
            state.instance_released_count += 1;
            return true;
        }

        state.exhausted = true;
        let fraction = state.limit - state.instance_released_count as f64;
        if random.draw() < fraction {
            state.instance_released_count += 1;
            true
        } else {
            false
        }
    }

    /// Whether the instance-side counters are too old to publish.
    pub fn is_instance_expired(&self, now: i64, window_size: u64) -> bool {
        let state = self.lock();
        state.instance_time == 0 || now - state.instance_time >= window_size as i64
    }

    /// Whether the cluster-side counter is too old to feed the weight.
    pub fn is_cluster_expired(&self, now: i64, window_size: u64) -> bool {
        let state = self.lock();
        state.cluster_time == 0 || now - state.cluster_time >= window_size as i64
    }

    pub fn set_cluster_request_count(&self, count: u64) {
        self.lock().cluster_request_count = count;
    }

    pub fn set_cluster_time(&self, second: i64) {
        self.lock().cluster_time = second;
    }

    /// Unused budget left in this slot; zero once exhausted.
    pub fn remain(&self) -> f64 {
        let state = self.lock();
        if state.exhausted {
            0.0
        } else {
            state.limit - state.instance_released_count as f64
        }
    }

    pub fn snapshot(&self) -> SlotView {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotView> {
        self.state.lock().expect("slot lock poisoned")
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{FixedRandom, SeededRandom};

    const DENY_BOUNDARY: FixedRandom = FixedRandom(0.999_999);
    const GRANT_BOUNDARY: FixedRandom = FixedRandom(0.0);

    fn fresh_slot(second: i64, limit: f64) -> Slot {
        let slot = Slot::new();
        slot.init(second);
        slot.set_limit(limit);
        slot
    }

    #[test]
    fn grants_up_to_integer_limit_then_denies() {
        let slot = fresh_slot(100, 3.0);

        assert!(slot.try_acquire_token(&DENY_BOUNDARY));
        assert!(slot.try_acquire_token(&DENY_BOUNDARY));
        assert!(slot.try_acquire_token(&DENY_BOUNDARY));
        assert!(!slot.try_acquire_token(&DENY_BOUNDARY));

        let view = slot.snapshot();
        assert_eq!(view.instance_released_count, 3);
        assert_eq!(view.instance_request_count, 4);
        assert!(view.exhausted);
    }

    #[test]
    fn exhaustion_latches_until_init() {
        let slot = fresh_slot(100, 1.0);
        assert!(slot.try_acquire_token(&GRANT_BOUNDARY));

        // The first denial flips the latch even with a lucky draw waiting.
        assert!(!slot.try_acquire_token(&GRANT_BOUNDARY));
        for _ in 0..10 {
            assert!(!slot.try_acquire_token(&GRANT_BOUNDARY));
        }
        assert_eq!(slot.snapshot().instance_released_count, 1);

        slot.init(101);
        assert!(slot.try_acquire_token(&GRANT_BOUNDARY));
    }

    #[test]
    fn denied_attempts_still_count_as_demand() {
        let slot = fresh_slot(100, 0.0);

        for _ in 0..5 {
            assert!(!slot.try_acquire_token(&DENY_BOUNDARY));
        }

        let view = slot.snapshot();
        assert_eq!(view.instance_request_count, 5);
        assert_eq!(view.instance_released_count, 0);
    }

    #[test]
    fn fractional_boundary_grants_on_low_draw() {
        let slot = fresh_slot(100, 2.4);

        assert!(slot.try_acquire_token(&GRANT_BOUNDARY));
        assert!(slot.try_acquire_token(&GRANT_BOUNDARY));
        // Third attempt crosses the fractional boundary: draw 0.0 < 0.4.
        assert!(slot.try_acquire_token(&GRANT_BOUNDARY));
        // The boundary decision is made once.
        assert!(!slot.try_acquire_token(&GRANT_BOUNDARY));

        assert_eq!(slot.snapshot().instance_released_count, 3);
    }

    #[test]
    fn fractional_boundary_denies_on_high_draw() {
        let slot = fresh_slot(100, 2.4);

        assert!(slot.try_acquire_token(&DENY_BOUNDARY));
        assert!(slot.try_acquire_token(&DENY_BOUNDARY));
        assert!(!slot.try_acquire_token(&DENY_BOUNDARY));

        let view = slot.snapshot();
        assert_eq!(view.instance_released_count, 2);
        assert!(view.exhausted);
    }

    #[test]
    fn fractional_limit_expected_grants_are_unbiased() {
        // With limit = n + f, the long-run mean of released counts over many
        // independent slots should approach the limit itself rather than its
        // floor or ceiling.
        let random = SeededRandom::new(42);
        let limit = 2.4;
        let trials = 2000;

        let mut released_total = 0u64;
        for trial in 0..trials {
            let slot = fresh_slot(trial, limit);
            for _ in 0..4 {
                slot.try_acquire_token(&random);
            }
            released_total += slot.snapshot().instance_released_count;
        }

        let mean = released_total as f64 / trials as f64;
        assert!(
            (mean - limit).abs() < 0.1,
            "mean grants {mean} drifted from limit {limit}"
        );
    }

    #[test]
    fn init_preserves_limit_and_cluster_fields() {
        let slot = fresh_slot(100, 5.0);
        slot.try_acquire_token(&DENY_BOUNDARY);
        slot.set_cluster_request_count(77);
        slot.set_cluster_time(95);

        slot.init(101);

        let view = slot.snapshot();
        assert_eq!(view.instance_time, 101);
        assert_eq!(view.instance_request_count, 0);
        assert_eq!(view.instance_released_count, 0);
        assert!(!view.exhausted);
        assert_eq!(view.limit, 5.0);
        assert_eq!(view.cluster_request_count, 77);
        assert_eq!(view.cluster_time, 95);
    }

    #[test]
    fn expiry_predicates() {
        let slot = Slot::new();
        // Never-initialized slots are expired on both sides.
        assert!(slot.is_instance_expired(100, 30));
        assert!(slot.is_cluster_expired(100, 30));

        slot.init(100);
        slot.set_cluster_time(100);
        assert!(!slot.is_instance_expired(100, 30));
        assert!(!slot.is_instance_expired(129, 30));
        assert!(slot.is_instance_expired(130, 30));
        assert!(!slot.is_cluster_expired(129, 30));
        assert!(slot.is_cluster_expired(130, 30));
    }

    #[test]
    fn remain_reports_unused_budget() {
        let slot = fresh_slot(100, 10.0);
        assert_eq!(slot.remain(), 10.0);

        for _ in 0..4 {
            slot.try_acquire_token(&DENY_BOUNDARY);
        }
        assert_eq!(slot.remain(), 6.0);

        for _ in 0..7 {
            slot.try_acquire_token(&DENY_BOUNDARY);
        }
        assert_eq!(slot.remain(), 0.0);
    }
}
