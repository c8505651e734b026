//! Counter store abstraction
//!
//! All security bookkeeping and session state lives in a [`CounterStore`]: a
//! shared, TTL-capable key-value store exposing a handful of atomic primitives.
//! Two kinds of implementation exist:
//!
//! - fast stores ([`StoreKind::Fast`]) such as [`MemoryCounterStore`] or a Redis
//!   backend, used as the primary store;
//! - durable stores ([`StoreKind::Durable`]) such as the SQLite backend, used
//!   when no primary store is available.
//!
//! Services never talk to a store directly. They go through a [`StoreClient`],
//! which bounds every call with a timeout and applies the retry policy: reads and
//! idempotent writes are retried once after a short backoff, windowed increments
//! are never retried so that an attempt cannot be counted twice.

pub mod memory;

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, config::StoreConfig, error::StorageError, keys::KeySpace};

pub use memory::MemoryCounterStore;

/// Whether a store is the fast primary or the durable fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Fast,
    Durable,
}

/// State of a windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u32,
    /// When the current window opened: the first increment after the window was empty or elapsed.
    pub window_start: DateTime<Utc>,
    /// When the counter was last incremented.
    pub last_updated: DateTime<Utc>,
}

impl CounterSnapshot {
    /// The count, or zero when the window has elapsed at `now`.
    pub fn active_count(&self, window: Duration, now: DateTime<Utc>) -> u32 {
        if now - self.window_start >= window {
            0
        } else {
            self.count
        }
    }
}

/// A shared key-value store with TTLs and atomic counters.
///
/// Implementations must make [`increment`](CounterStore::increment) and
/// [`set_if_absent`](CounterStore::set_if_absent) atomic across processes.
/// Entries past their TTL must read as absent even if the backend has not yet
/// physically removed them.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Which role this store plays.
    fn kind(&self) -> StoreKind;

    /// Atomically increment a windowed counter.
    ///
    /// If the counter is absent, expired, or its window (measured from
    /// `window_start`) has elapsed, it restarts at 1 with `window_start = now`.
    /// Otherwise the count goes up by one and the window start is kept. The
    /// entry's TTL is reset to `ttl` on every increment.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
    ) -> Result<CounterSnapshot, Error>;

    /// Read a counter without modifying it.
    async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Set a value, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error>;

    /// Set a value only if the key is absent (or expired). Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error>;

    /// Replace a value only if the key holds a live value. Returns whether it was set.
    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error>;

    /// Delete whatever is stored under `key`. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool, Error>;

    /// Add a member to a set, extending the set's lifetime to at least `ttl`.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error>;

    /// Remove a member from a set. Returns whether it was present.
    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Remove every entry last written before `cutoff`. Returns the number removed.
    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;

    /// Physically remove entries under `prefix` whose TTL has passed.
    /// Returns the number removed.
    ///
    /// Stores with native expiry have nothing to do here.
    async fn purge_expired(&self, _prefix: &str) -> Result<u64, Error> {
        Ok(0)
    }

    /// Prepare the backing schema, if the store has one.
    async fn migrate(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error>;
}

/// Pick the store services will run against.
///
/// The primary store is used whenever one is configured; otherwise the durable
/// store takes its place with the same contract. The choice is made once, at
/// construction, so no request ever sees a mix of the two.
pub fn select_store(
    primary: Option<Arc<dyn CounterStore>>,
    durable: Arc<dyn CounterStore>,
) -> Arc<dyn CounterStore> {
    match primary {
        Some(primary) => {
            tracing::info!(kind = ?primary.kind(), "Using primary counter store");
            primary
        }
        None => {
            tracing::warn!(
                kind = ?durable.kind(),
                "No primary counter store available, falling back to durable store"
            );
            durable
        }
    }
}

/// Handle through which services reach the counter store.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    operation_timeout: std::time::Duration,
    retry_backoff: std::time::Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn CounterStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            keys: KeySpace::new(config.namespace.clone()),
            operation_timeout: config.operation_timeout,
            retry_backoff: config.read_retry_backoff,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn kind(&self) -> StoreKind {
        self.store.kind()
    }

    pub fn inner(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    async fn bounded<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, Error>
    where
        Fut: Future<Output = Result<T, Error>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout = ?self.operation_timeout, "Counter store call timed out");
                Err(StorageError::Unavailable(format!(
                    "{op} timed out after {:?}",
                    self.operation_timeout
                ))
                .into())
            }
        }
    }

    /// Run a call that is safe to repeat, retrying once if the store was unavailable.
    async fn retrying<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.bounded(op, call()).await {
            Err(e) if e.is_store_unavailable() => {
                tracing::debug!(op, error = %e, "Retrying counter store call");
                tokio::time::sleep(self.retry_backoff).await;
                self.bounded(op, call()).await
            }
            other => other,
        }
    }

    /// Increment a windowed counter. Never retried.
    pub async fn increment(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
    ) -> Result<CounterSnapshot, Error> {
        self.bounded("increment", self.store.increment(key, window, ttl))
            .await
    }

    pub async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error> {
        self.retrying("counter", || self.store.counter(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.retrying("get", || self.store.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.retrying("set", || self.store.set(key, value, ttl)).await
    }

    /// Set-if-absent. Never retried: a lost reply would make a successful write look like a conflict.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        self.bounded("set_if_absent", self.store.set_if_absent(key, value, ttl))
            .await
    }

    pub async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        self.retrying("set_if_present", || self.store.set_if_present(key, value, ttl))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, Error> {
        self.retrying("delete", || self.store.delete(key)).await
    }

    pub async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error> {
        self.retrying("add_to_set", || self.store.add_to_set(key, member, ttl))
            .await
    }

    pub async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.retrying("remove_from_set", || self.store.remove_from_set(key, member))
            .await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        self.retrying("set_members", || self.store.set_members(key))
            .await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.retrying("scan_prefix", || self.store.scan_prefix(prefix))
            .await
    }

    pub async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        self.retrying("expire_before", || self.store.expire_before(cutoff))
            .await
    }

    pub async fn purge_expired(&self, prefix: &str) -> Result<u64, Error> {
        self.retrying("purge_expired", || self.store.purge_expired(prefix))
            .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), Error> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl).await
    }

    pub async fn set_json_if_absent<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let raw = serde_json::to_string(value)?;
        self.set_if_absent(key, &raw, ttl).await
    }

    pub async fn set_json_if_present<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let raw = serde_json::to_string(value)?;
        self.set_if_present(key, &raw, ttl).await
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        self.store.migrate().await
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.bounded("health_check", self.store.health_check())
            .await
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::FlakyStore;
    use super::*;
    use crate::clock::ManualClock;

    fn client_for(store: Arc<dyn CounterStore>) -> StoreClient {
        let config = StoreConfig {
            read_retry_backoff: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        StoreClient::new(store, &config)
    }

    #[test]
    fn test_active_count_resets_after_window() {
        let start = Utc::now();
        let snapshot = CounterSnapshot {
            count: 4,
            window_start: start,
            last_updated: start,
        };
        let window = Duration::minutes(15);
        assert_eq!(snapshot.active_count(window, start + Duration::minutes(14)), 4);
        assert_eq!(snapshot.active_count(window, start + Duration::minutes(15)), 0);
    }

    #[test]
    fn test_select_store_prefers_primary() {
        let clock = ManualClock::starting_now();
        let primary: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(clock.clone()));
        let durable: Arc<dyn CounterStore> =
            Arc::new(MemoryCounterStore::durable(clock.clone()));

        let selected = select_store(Some(primary), durable.clone());
        assert_eq!(selected.kind(), StoreKind::Fast);

        let selected = select_store(None, durable);
        assert_eq!(selected.kind(), StoreKind::Durable);
    }

    #[tokio::test]
    async fn test_reads_retry_once_when_unavailable() {
        let flaky = Arc::new(FlakyStore::new(MemoryCounterStore::new(
            ManualClock::starting_now(),
        )));
        flaky.set_available(false);
        let client = client_for(flaky.clone());

        let result = client.get("missing").await;
        assert!(result.unwrap_err().is_store_unavailable());
        assert_eq!(flaky.failed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_increment_is_never_retried() {
        let flaky = Arc::new(FlakyStore::new(MemoryCounterStore::new(
            ManualClock::starting_now(),
        )));
        flaky.set_available(false);
        let client = client_for(flaky.clone());

        let result = client
            .increment("counter", Duration::minutes(1), Duration::minutes(2))
            .await;
        assert!(result.unwrap_err().is_store_unavailable());
        assert_eq!(flaky.failed_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let client = client_for(Arc::new(MemoryCounterStore::new(
            ManualClock::starting_now(),
        )));

        client
            .set_json("k", &vec![1u32, 2, 3], Duration::minutes(1))
            .await
            .unwrap();
        let value: Option<Vec<u32>> = client.get_json("k").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Fast
        }

        async fn increment(
            &self,
            _key: &str,
            _window: Duration,
            _ttl: Duration,
        ) -> Result<CounterSnapshot, Error> {
            std::future::pending().await
        }

        async fn counter(&self, _key: &str) -> Result<Option<CounterSnapshot>, Error> {
            std::future::pending().await
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, Error> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), Error> {
            std::future::pending().await
        }

        async fn set_if_absent(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, Error> {
            std::future::pending().await
        }

        async fn set_if_present(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool, Error> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<bool, Error> {
            std::future::pending().await
        }

        async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<(), Error> {
            std::future::pending().await
        }

        async fn remove_from_set(&self, _key: &str, _member: &str) -> Result<bool, Error> {
            std::future::pending().await
        }

        async fn set_members(&self, _key: &str) -> Result<Vec<String>, Error> {
            std::future::pending().await
        }

        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>, Error> {
            std::future::pending().await
        }

        async fn expire_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, Error> {
            std::future::pending().await
        }

        async fn health_check(&self) -> Result<(), Error> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_store_surfaces_unavailable() {
        let config = StoreConfig::default()
            .with_operation_timeout(std::time::Duration::from_millis(20));
        let client = StoreClient::new(Arc::new(StalledStore), &config);

        let result = client
            .increment("k", Duration::minutes(1), Duration::minutes(1))
            .await;
        assert!(result.unwrap_err().is_store_unavailable());
    }
}
