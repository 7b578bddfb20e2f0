//! Injectable randomness for the fractional admission boundary.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform draws in `[0, 1)`.
///
/// The only consumer is the fractional-boundary decision in the slot, which
/// draws once per slot per second. Injecting the source keeps that decision
/// deterministic under test.
pub trait RandomSource: Send + Sync {
    fn draw(&self) -> f64;
}

/// Production source backed by the thread-local RNG.
#[derive(Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn draw(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same value. Test source.
#[derive(Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn draw(&self) -> f64 {
        self.0
    }
}

/// Seeded PRNG source for reproducible statistical tests.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn draw(&self) -> f64 {
        self.rng.lock().expect("rng lock poisoned").gen::<f64>()
    }
}
