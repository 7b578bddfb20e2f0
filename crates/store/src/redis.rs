//! Redis-backed [`Store`] on a deadpool connection pool.

use async_trait::async_trait;
use deadpool_redis::redis::{self, Value};
use deadpool_redis::{Config, Pool, Runtime};

use crate::{Command, Pipeline, Reply, Store, StoreError};

/// A pooled Redis client executing staged pipelines in one round-trip.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        let pool = Config::from_url(url)
            .builder()
            .map_err(|e| StoreError::Backend(format!("invalid redis config: {e}")))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to build redis pool: {e}")))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis connect failed: {e}")))?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Unavailable(format!("redis ping failed: {e}")))?;
        }

        tracing::info!(url, pool_size, "connected to redis coordination store");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis pool exhausted: {e}")))?;

        let mut pipe = redis::pipe();
        for command in pipeline.commands() {
            match command {
                Command::IncrBy { key, delta } => {
                    pipe.cmd("INCRBY").arg(key).arg(*delta);
                }
                Command::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds);
                }
                Command::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
            }
        }

        let values: Vec<Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("redis pipeline failed: {e}")))?;

        Ok(values.into_iter().map(value_to_reply).collect())
    }
}

fn value_to_reply(value: Value) -> Reply {
    match value {
        Value::Int(n) => Reply::Int(n),
        Value::BulkString(bytes) => Reply::Bulk(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(s) => Reply::Bulk(s),
        Value::Nil => Reply::Nil,
        other => {
            tracing::warn!(?other, "unexpected redis reply type, treating as nil");
            Reply::Nil
        }
    }
}
