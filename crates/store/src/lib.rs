//! Coordination store access for flowgate.
//!
//! The limiter core only ever talks to the store through a [`Pipeline`] that
//! is staged across all limiters and flushed in a single round-trip per sync
//! tick. The capability set is deliberately tiny: atomic increment, key TTL,
//! and read. Any backend providing those three commands plus pipelining can
//! implement [`Store`].

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A single staged command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    IncrBy { key: String, delta: u64 },
    Expire { key: String, seconds: u64 },
    Get { key: String },
}

/// Reply to one staged command.
///
/// Replies are positionally aligned with the order commands were staged in;
/// the index returned when staging is the index into the reply vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Integer reply (`INCRBY` result, `EXPIRE` acknowledgement).
    Int(i64),
    /// Bulk string reply (`GET` hit).
    Bulk(String),
    /// Missing or expired key.
    Nil,
}

/// An ordered batch of commands executed in one round-trip.
#[derive(Debug, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `INCRBY key delta`; returns the reply index.
    pub fn incr_by(&mut self, key: String, delta: u64) -> usize {
        self.push(Command::IncrBy { key, delta })
    }

    /// Stage `EXPIRE key seconds`; returns the reply index.
    pub fn expire(&mut self, key: String, seconds: u64) -> usize {
        self.push(Command::Expire { key, seconds })
    }

    /// Stage `GET key`; returns the reply index.
    pub fn get(&mut self, key: String) -> usize {
        self.push(Command::Get { key })
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    fn push(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }
}

/// A pipelined coordination store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Flush a staged pipeline, returning one [`Reply`] per command in stage
    /// order. A failed flush loses the whole batch; callers treat that as a
    /// skipped tick, not a fatal condition.
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError>;
}
