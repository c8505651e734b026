//! In-process counter store
//!
//! Backed by a [`DashMap`]; each key's shard lock makes increments and
//! set-if-absent atomic within the process. Expiry is lazy: entries past their
//! TTL read as absent and are physically removed by [`purge_expired`] or the
//! next write.
//!
//! [`purge_expired`]: CounterStore::purge_expired

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry as MapEntry};

use super::{CounterSnapshot, CounterStore, StoreKind};
use crate::{Error, clock::Clock};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Counter {
        count: u32,
        window_start: DateTime<Utc>,
    },
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: DateTime<Utc>,
    written_at: DateTime<Utc>,
}

impl StoredEntry {
    fn new(value: Value, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: now + ttl,
            written_at: now,
        }
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A [`CounterStore`] held in process memory.
///
/// Suitable for single-process deployments and tests. State is lost on restart.
pub struct MemoryCounterStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
    kind: StoreKind,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            kind: StoreKind::Fast,
        }
    }

    /// A memory store that reports itself as durable, for exercising the fallback path.
    pub fn durable(clock: Arc<dyn Clock>) -> Self {
        Self {
            kind: StoreKind::Durable,
            ..Self::new(clock)
        }
    }

    /// Number of entries physically held, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live<T>(&self, key: &str, read: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        if entry.is_live(now) {
            read(&entry.value)
        } else {
            None
        }
    }

    fn remove_where(&self, predicate: impl Fn(&str, &StoredEntry) -> bool) -> u64 {
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.key(), entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self
                .entries
                .remove_if(&key, |key, entry| predicate(key, entry))
                .is_some()
            {
                removed += 1;
            }
        }
        removed
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
    ) -> Result<CounterSnapshot, Error> {
        let now = self.clock.now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| {
            StoredEntry::new(
                Value::Counter {
                    count: 0,
                    window_start: now,
                },
                now,
                Duration::zero(),
            )
        });
        let entry = slot.value_mut();

        let (count, window_start) = match entry.value {
            Value::Counter {
                count,
                window_start,
            } if entry.is_live(now) && now - window_start < window => {
                (count.saturating_add(1), window_start)
            }
            _ => (1, now),
        };

        entry.value = Value::Counter {
            count,
            window_start,
        };
        entry.expires_at = now + ttl;
        entry.written_at = now;

        Ok(CounterSnapshot {
            count,
            window_start,
            last_updated: now,
        })
    }

    async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error> {
        let now = self.clock.now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            return Ok(None);
        }
        match entry.value {
            Value::Counter {
                count,
                window_start,
            } => Ok(Some(CounterSnapshot {
                count,
                window_start,
                last_updated: entry.written_at,
            })),
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.live(key, |value| match value {
            Value::Text(text) => Some(text.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            StoredEntry::new(Value::Text(value.to_string()), now, ttl),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let now = self.clock.now();
        let fresh = StoredEntry::new(Value::Text(value.to_string()), now, ttl);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && matches!(entry.value, Value::Text(_)) => {
                *entry = StoredEntry::new(Value::Text(value.to_string()), now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error> {
        let now = self.clock.now();
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(Value::Set(BTreeSet::new()), now, ttl));
        let entry = slot.value_mut();

        if !entry.is_live(now) || !matches!(entry.value, Value::Set(_)) {
            *entry = StoredEntry::new(Value::Set(BTreeSet::new()), now, ttl);
        }
        if let Value::Set(members) = &mut entry.value {
            members.insert(member.to_string());
        }
        entry.expires_at = entry.expires_at.max(now + ttl);
        entry.written_at = now;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error> {
        let now = self.clock.now();
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => match &mut entry.value {
                Value::Set(members) => members.remove(member),
                _ => false,
            },
            _ => false,
        };

        self.entries
            .remove_if(key, |_, entry| matches!(&entry.value, Value::Set(m) if m.is_empty()));
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .live(key, |value| match value {
                Value::Set(members) => Some(members.iter().cloned().collect()),
                _ => None,
            })
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let removed = self.remove_where(|_, entry| entry.written_at < cutoff);
        tracing::debug!(removed, %cutoff, "Expired memory store entries");
        Ok(removed)
    }

    async fn purge_expired(&self, prefix: &str) -> Result<u64, Error> {
        let now = self.clock.now();
        Ok(self.remove_where(|key, entry| key.starts_with(prefix) && !entry.is_live(now)))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = ManualClock::starting_now();
        let store = MemoryCounterStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let (clock, store) = store();
        let window = Duration::minutes(15);
        let ttl = Duration::hours(1);

        let first = store.increment("k", window, ttl).await.unwrap();
        assert_eq!(first.count, 1);

        clock.advance(Duration::minutes(5));
        let second = store.increment("k", window, ttl).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.window_start, first.window_start);
        assert_eq!(second.last_updated, clock.now());
    }

    #[tokio::test]
    async fn test_increment_restarts_after_window() {
        let (clock, store) = store();
        let window = Duration::minutes(15);
        let ttl = Duration::hours(1);

        store.increment("k", window, ttl).await.unwrap();
        store.increment("k", window, ttl).await.unwrap();

        clock.advance(Duration::minutes(15));
        let snapshot = store.increment("k", window, ttl).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.window_start, clock.now());
    }

    #[tokio::test]
    async fn test_increment_restarts_after_ttl() {
        let (clock, store) = store();
        store
            .increment("k", Duration::hours(2), Duration::minutes(1))
            .await
            .unwrap();

        clock.advance(Duration::minutes(2));
        assert!(store.counter("k").await.unwrap().is_none());
        let snapshot = store
            .increment("k", Duration::hours(2), Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemoryCounterStore::new(clock));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment("shared", Duration::minutes(15), Duration::hours(1))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.counter("shared").await.unwrap().unwrap();
        assert_eq!(snapshot.count, 50);
    }

    #[tokio::test]
    async fn test_values_expire() {
        let (clock, store) = store();
        store.set("k", "v", Duration::seconds(30)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::seconds(30));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (clock, store) = store();
        assert!(store.set_if_absent("k", "a", Duration::seconds(10)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::seconds(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        clock.advance(Duration::seconds(11));
        assert!(store.set_if_absent("k", "b", Duration::seconds(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_set_if_present() {
        let (clock, store) = store();
        assert!(!store.set_if_present("k", "a", Duration::seconds(10)).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "a", Duration::seconds(10)).await.unwrap();
        clock.advance(Duration::seconds(5));
        assert!(store.set_if_present("k", "b", Duration::seconds(10)).await.unwrap());
        clock.advance(Duration::seconds(9));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));

        clock.advance(Duration::seconds(1));
        assert!(!store.set_if_present("k", "c", Duration::seconds(10)).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sets() {
        let (_clock, store) = store();
        store.add_to_set("s", "b", Duration::minutes(1)).await.unwrap();
        store.add_to_set("s", "a", Duration::minutes(1)).await.unwrap();
        store.add_to_set("s", "a", Duration::minutes(1)).await.unwrap();
        assert_eq!(store.set_members("s").await.unwrap(), vec!["a", "b"]);

        assert!(store.remove_from_set("s", "a").await.unwrap());
        assert!(!store.remove_from_set("s", "a").await.unwrap());
        assert!(store.remove_from_set("s", "b").await.unwrap());
        assert!(store.set_members("s").await.unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_lifetime_only_extends() {
        let (clock, store) = store();
        store.add_to_set("s", "long", Duration::hours(1)).await.unwrap();
        store.add_to_set("s", "short", Duration::minutes(1)).await.unwrap();

        clock.advance(Duration::minutes(30));
        assert_eq!(store.set_members("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scan_prefix_skips_expired() {
        let (clock, store) = store();
        store.set("p:1", "x", Duration::minutes(1)).await.unwrap();
        store.set("p:2", "x", Duration::minutes(10)).await.unwrap();
        store.set("q:1", "x", Duration::minutes(10)).await.unwrap();

        clock.advance(Duration::minutes(2));
        assert_eq!(store.scan_prefix("p:").await.unwrap(), vec!["p:2"]);
        assert_eq!(store.purge_expired("q:").await.unwrap(), 0);
        assert_eq!(store.purge_expired("p:").await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_expire_before_cutoff() {
        let (clock, store) = store();
        store.set("old", "x", Duration::days(30)).await.unwrap();
        store
            .increment("old-counter", Duration::days(1), Duration::days(30))
            .await
            .unwrap();

        clock.advance(Duration::hours(1));
        let cutoff = clock.now();
        store.set("new", "x", Duration::days(30)).await.unwrap();

        assert_eq!(store.expire_before(cutoff).await.unwrap(), 2);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.counter("old-counter").await.unwrap().is_none());
        assert!(store.get("new").await.unwrap().is_some());
    }
}
