//! In-process [`Store`] used by tests and single-node deployments.
//!
//! Behaves like the Redis subset flowgate relies on: `INCRBY` on a missing
//! key yields the delta, `GET` on a missing or expired key yields nil. A
//! fail-switch lets tests simulate a store outage without tearing anything
//! down; several limiter instances pointed at one `MemoryStore` behave like
//! fleet members sharing a cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{Command, Pipeline, Reply, Store, StoreError};

struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the simulated outage. While unavailable every `execute` call
    /// fails and no staged command is applied.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Read a counter directly, bypassing the pipeline. Test helper.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value)
    }

    fn apply(&self, command: &Command, now: Instant) -> Reply {
        match command {
            Command::IncrBy { key, delta } => {
                let mut entry = self.entries.entry(key.clone()).or_insert(Entry {
                    value: 0,
                    expires_at: None,
                });
                if entry.is_expired(now) {
                    entry.value = 0;
                    entry.expires_at = None;
                }
                entry.value += *delta as i64;
                Reply::Int(entry.value)
            }
            Command::Expire { key, seconds } => match self.entries.get_mut(key) {
                Some(mut entry) if !entry.is_expired(now) => {
                    entry.expires_at = Some(now + Duration::from_secs(*seconds));
                    Reply::Int(1)
                }
                _ => Reply::Int(0),
            },
            Command::Get { key } => match self.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => Reply::Bulk(entry.value.to_string()),
                _ => Reply::Nil,
            },
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }

        let now = Instant::now();
        Ok(pipeline
            .commands()
            .iter()
            .map(|command| self.apply(command, now))
            .collect())
    }
}
