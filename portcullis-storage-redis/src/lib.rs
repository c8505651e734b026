//! Redis counter store
//!
//! The fast primary store. Works against Redis and wire-compatible servers
//! such as Dragonfly. Expiry is handled by the server; windows are computed
//! from the injected clock.
//!
//! Layout per key kind:
//!
//! - values are plain strings written with `SET ... PX`;
//! - windowed counters are hashes (`count`, `window_start`, `updated_at`)
//!   updated by a Lua script so the window check and increment are one step;
//! - sets are native Redis sets whose TTL only ever grows.
//!
//! Every write also records the key in a per-namespace sorted set scored by
//! write time. [`CounterStore::expire_before`] walks that index instead of
//! scanning the keyspace.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portcullis_core::{
    Error,
    clock::Clock,
    error::StorageError,
    storage::{CounterSnapshot, CounterStore, StoreKind},
};
use redis::{Script, aio::ConnectionManager};

const INCREMENT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local count = redis.call('HGET', KEYS[1], 'count')
local start = redis.call('HGET', KEYS[1], 'window_start')
if count and start and (now - tonumber(start)) < window then
    count = tonumber(count) + 1
    start = tonumber(start)
else
    count = 1
    start = now
end
redis.call('HSET', KEYS[1], 'count', count, 'window_start', start, 'updated_at', now)
redis.call('PEXPIRE', KEYS[1], ttl)
redis.call('ZADD', KEYS[2], now, KEYS[1])
return {count, start, now}
"#;

const SET_IF_ABSENT_SCRIPT: &str = r#"
local created = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
if created then
    redis.call('ZADD', KEYS[2], ARGV[3], KEYS[1])
    return 1
end
return 0
"#;

const SET_IF_PRESENT_SCRIPT: &str = r#"
local updated = redis.call('SET', KEYS[1], ARGV[1], 'XX', 'PX', ARGV[2])
if updated then
    redis.call('ZADD', KEYS[2], ARGV[3], KEYS[1])
    return 1
end
return 0
"#;

const ADD_TO_SET_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[2])
redis.call('SADD', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < ttl then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
redis.call('ZADD', KEYS[2], ARGV[3], KEYS[1])
return 1
"#;

/// Delete a key only if it has not been rewritten since the cutoff.
const EXPIRE_IF_OLDER_SCRIPT: &str = r#"
local written = redis.call('ZSCORE', KEYS[2], KEYS[1])
if written and tonumber(written) < tonumber(ARGV[1]) then
    redis.call('ZREM', KEYS[2], KEYS[1])
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 200;

/// Map a redis error into the portcullis taxonomy.
pub fn map_redis_error(e: redis::RedisError) -> Error {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        StorageError::Unavailable(e.to_string()).into()
    } else {
        StorageError::Database(e.to_string()).into()
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {millis}")).into())
}

/// Escape glob metacharacters for a `SCAN ... MATCH` prefix pattern.
fn match_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    index_key: String,
    clock: Arc<dyn Clock>,
    increment: Script,
    set_if_absent: Script,
    set_if_present: Script,
    add_to_set: Script,
    expire_if_older: Script,
}

impl RedisCounterStore {
    /// Connect to `url` and verify the server answers.
    ///
    /// `namespace` must match the key namespace the services use; it names the
    /// write index.
    pub async fn connect(url: &str, namespace: &str, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            tracing::warn!(error = %e, "Failed to create Redis client");
            StorageError::Unavailable(format!("invalid Redis URL: {e}"))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to connect to Redis");
            map_redis_error(e)
        })?;

        let store = Self {
            connection_manager,
            index_key: format!("{namespace}:write-index"),
            clock,
            increment: Script::new(INCREMENT_SCRIPT),
            set_if_absent: Script::new(SET_IF_ABSENT_SCRIPT),
            set_if_present: Script::new(SET_IF_PRESENT_SCRIPT),
            add_to_set: Script::new(ADD_TO_SET_SCRIPT),
            expire_if_older: Script::new(EXPIRE_IF_OLDER_SCRIPT),
        };
        store.health_check().await?;

        tracing::debug!("Connected to Redis counter store");
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Fast
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
    ) -> Result<CounterSnapshot, Error> {
        let mut conn = self.conn();
        let (count, window_start, updated_at): (i64, i64, i64) = self
            .increment
            .key(key)
            .key(&self.index_key)
            .arg(self.now_millis())
            .arg(window.num_milliseconds())
            .arg(ttl.num_milliseconds().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(CounterSnapshot {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            window_start: from_millis(window_start)?,
            last_updated: from_millis(updated_at)?,
        })
    }

    async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error> {
        let mut conn = self.conn();
        let fields: (Option<i64>, Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg("count")
            .arg("window_start")
            .arg("updated_at")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match fields {
            (Some(count), Some(window_start), Some(updated_at)) => Ok(Some(CounterSnapshot {
                count: u32::try_from(count).unwrap_or(u32::MAX),
                window_start: from_millis(window_start)?,
                last_updated: from_millis(updated_at)?,
            })),
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.num_milliseconds().max(1))
            .ignore()
            .cmd("ZADD")
            .arg(&self.index_key)
            .arg(self.now_millis())
            .arg(key)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.conn();
        let created: i64 = self
            .set_if_absent
            .key(key)
            .key(&self.index_key)
            .arg(value)
            .arg(ttl.num_milliseconds().max(1))
            .arg(self.now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(created == 1)
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let mut conn = self.conn();
        let updated: i64 = self
            .set_if_present
            .key(key)
            .key(&self.index_key)
            .arg(value)
            .arg(ttl.num_milliseconds().max(1))
            .arg(self.now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn();
        let (deleted,): (i64,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(key)
            .cmd("ZREM")
            .arg(&self.index_key)
            .arg(key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(deleted > 0)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn();
        let _: i64 = self
            .add_to_set
            .key(key)
            .key(&self.index_key)
            .arg(member)
            .arg(ttl.num_milliseconds().max(1))
            .arg(self.now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        members.sort();
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn();
        let pattern = match_prefix(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            keys.extend(batch.into_iter().filter(|key| key != &self.index_key));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut conn = self.conn();
        let cutoff = cutoff.timestamp_millis();
        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.index_key)
            .arg("-inf")
            .arg(format!("({cutoff}"))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut removed = 0;
        for key in candidates {
            let deleted: i64 = self
                .expire_if_older
                .key(&key)
                .key(&self.index_key)
                .arg(cutoff)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            removed += u64::try_from(deleted).unwrap_or(0);
        }

        tracing::debug!(removed, cutoff, "Expired Redis store entries");
        Ok(removed)
    }

    /// Keys expire on the server. This only drops write-index entries under
    /// `prefix` whose keys are already gone, and returns how many it dropped.
    async fn purge_expired(&self, prefix: &str) -> Result<u64, Error> {
        let mut conn = self.conn();
        let pattern = match_prefix(prefix);
        let mut cursor: u64 = 0;
        let mut pruned = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("ZSCAN")
                .arg(&self.index_key)
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            // ZSCAN returns member, score pairs.
            for key in batch.into_iter().step_by(2) {
                let exists: i64 = redis::cmd("EXISTS")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                if exists == 0 {
                    let removed: i64 = redis::cmd("ZREM")
                        .arg(&self.index_key)
                        .arg(&key)
                        .query_async(&mut conn)
                        .await
                        .map_err(map_redis_error)?;
                    pruned += u64::try_from(removed).unwrap_or(0);
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(pruned)
    }

    async fn health_check(&self) -> Result<(), Error> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
