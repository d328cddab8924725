//! Redis record store
//!
//! Every command runs on a clone of one multiplexed connection and is bounded
//! by the configured round-trip timeout.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use std::time::Duration;
use tokio::time::timeout;

use super::record_store::{RecordStore, StoreError};

/// Compare-and-delete, so a worker only ever releases its own claim
static DELETE_IF_EQUALS: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

const SCAN_BATCH: usize = 200;

/// Redis-backed record store
#[derive(Clone)]
pub struct RedisRecordStore {
    conn: MultiplexedConnection,
    timeout: Duration,
}

impl RedisRecordStore {
    /// Connect and verify the server answers `PING`
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL: {}", e)))?;

        let conn = timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(op_timeout))?
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to Redis: {}", e)))?;

        let store = Self {
            conn,
            timeout: op_timeout,
        };
        store.health_check().await?;

        tracing::info!("Connected to Redis record store");
        Ok(store)
    }

    async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut conn = self.conn.clone();
        match timeout(self.timeout, cmd.query_async(&mut conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}

/// Redis rounds sub-second expiries down to zero, which it rejects
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let _: () = self
            .run(redis::cmd("SET").arg(key).arg(value).arg("EX").arg(ttl_secs(ttl)))
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // SET NX replies OK when written and nil otherwise
        let reply: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let value: Option<String> = self.run(redis::cmd("GET").arg(key)).await?;
        value.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.run(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = DELETE_IF_EQUALS.key(key);
        invocation.arg(expected);

        let removed: i64 = match timeout(self.timeout, invocation.invoke_async(&mut conn)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(e)) => return Err(StoreError::Unavailable(e.to_string())),
            Err(_) => return Err(StoreError::Timeout(self.timeout)),
        };
        Ok(removed > 0)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = escape_glob(prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
