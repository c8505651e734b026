#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use portcullis::{
    CaptchaVerifier, CounterStore, CredentialCheck, CredentialVerifier, Error, LoginSecurityConfig,
    ManualClock, MemoryCounterStore, RequestContext, StoreKind, UserLookup, UserRecord,
};
use portcullis_core::{error::StorageError, storage::CounterSnapshot};

pub const PASSWORD: &str = "correct horse battery staple";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// A manual clock on a whole millisecond, so SQLite round trips compare equal.
pub fn clock() -> Arc<ManualClock> {
    let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
    Arc::new(ManualClock::new(now))
}

/// Default thresholds with captcha escalation turned off.
pub fn without_captcha() -> LoginSecurityConfig {
    LoginSecurityConfig {
        captcha_threshold: 0,
        ..Default::default()
    }
}

pub fn browser(ip: &str) -> RequestContext {
    RequestContext::new(ip)
        .with_user_agent("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
        .with_accept_language("en-GB,en;q=0.9")
        .with_accept_encoding("gzip, deflate, br")
}

/// Accounts known to the application, all sharing [`PASSWORD`].
pub struct Accounts {
    users: HashMap<String, UserRecord>,
    pub verifications: AtomicUsize,
}

impl Accounts {
    pub fn new(users: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            users: users
                .iter()
                .map(|(identifier, id)| (identifier.to_string(), UserRecord::new(*id, "user")))
                .collect(),
            verifications: AtomicUsize::new(0),
        })
    }

    pub fn verifications(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialVerifier for Accounts {
    async fn verify(&self, identifier: &str, password: &str) -> Result<CredentialCheck, Error> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        Ok(match self.users.get(identifier) {
            None => CredentialCheck::UnknownIdentifier,
            Some(_) if password == PASSWORD => CredentialCheck::Valid,
            Some(_) => CredentialCheck::InvalidPassword,
        })
    }
}

#[async_trait]
impl UserLookup for Accounts {
    async fn find_user(&self, identifier: &str) -> Result<Option<UserRecord>, Error> {
        Ok(self.users.get(identifier).cloned())
    }
}

/// Accepts exactly one token.
pub struct StaticCaptcha(pub &'static str);

#[async_trait]
impl CaptchaVerifier for StaticCaptcha {
    async fn verify(&self, token: &str, _ip: &str) -> Result<bool, Error> {
        Ok(token == self.0)
    }
}

/// A memory store whose connection can be cut, entirely or for writes only.
pub struct SwitchableStore {
    inner: MemoryCounterStore,
    available: AtomicBool,
    writable: AtomicBool,
}

impl SwitchableStore {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCounterStore::new(clock),
            available: AtomicBool::new(true),
            writable: AtomicBool::new(true),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("connection refused".to_string()).into())
        }
    }

    fn check_write(&self) -> Result<(), Error> {
        self.check()?;
        if self.writable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("read-only replica".to_string()).into())
        }
    }
}

#[async_trait]
impl CounterStore for SwitchableStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Fast
    }

    async fn increment(&self, key: &str, window: Duration, ttl: Duration) -> Result<CounterSnapshot, Error> {
        self.check_write()?;
        self.inner.increment(key, window, ttl).await
    }

    async fn counter(&self, key: &str) -> Result<Option<CounterSnapshot>, Error> {
        self.check()?;
        self.inner.counter(key).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.check_write()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        self.check_write()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, Error> {
        self.check_write()?;
        self.inner.set_if_present(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        self.check_write()?;
        self.inner.delete(key).await
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), Error> {
        self.check_write()?;
        self.inner.add_to_set(key, member, ttl).await
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, Error> {
        self.check_write()?;
        self.inner.remove_from_set(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        self.check()?;
        self.inner.set_members(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.check()?;
        self.inner.scan_prefix(prefix).await
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        self.check_write()?;
        self.inner.expire_before(cutoff).await
    }

    async fn purge_expired(&self, prefix: &str) -> Result<u64, Error> {
        self.check_write()?;
        self.inner.purge_expired(prefix).await
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.check()
    }
}
