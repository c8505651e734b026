//! Builder pattern for constructing Portcullis instances
//!
//! This module provides a type-safe builder for creating [`Portcullis`] instances with
//! compile-time validation of store configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portcullis::{
//!     CaptchaVerifier, CredentialVerifier, LoginSecurityConfig, PortcullisBuilder, UserLookup,
//! };
//!
//! # async fn example(
//! #     verifier: Arc<dyn CredentialVerifier>,
//! #     users: Arc<dyn UserLookup>,
//! #     captcha: Arc<dyn CaptchaVerifier>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! // Durable SQLite store with auto-migration
//! let portcullis = PortcullisBuilder::new()
//!     .with_sqlite("sqlite::memory:")
//!     .await?
//!     .apply_migrations(true)
//!     .with_captcha_verifier(captcha)
//!     .build(verifier.clone(), users.clone())
//!     .await?;
//!
//! // Or a process-local store without captcha escalation, e.g. for tests
//! let portcullis = PortcullisBuilder::new()
//!     .with_memory_store()
//!     .with_login_security_config(LoginSecurityConfig {
//!         captcha_threshold: 0,
//!         ..Default::default()
//!     })
//!     .build(verifier, users)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use portcullis_core::{
    CaptchaVerifier, Clock, CounterStore, CredentialVerifier, LoginSecurityConfig,
    MemoryCounterStore, SessionConfig, StoreClient, StoreConfig, UserLookup, clock::system_clock,
    storage::select_store,
};

use crate::Portcullis;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur when building a Portcullis instance.
#[derive(Debug, thiserror::Error)]
pub enum PortcullisBuilderError {
    /// Failed to connect to a store
    #[error("Store connection failed: {0}")]
    StoreConnection(String),

    /// Failed to run database migrations
    #[error("Migration failed: {0}")]
    Migration(String),

    /// Invalid configuration provided
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

// ============================================================================
// Type-State Markers
// ============================================================================

/// Marker type indicating no store has been configured yet.
///
/// This is the initial state of [`PortcullisBuilder`].
pub struct NoStore;

/// Marker type indicating the durable store has been configured.
///
/// A fast primary store may be layered on top; when none is set the durable
/// store serves every request.
pub struct WithStore {
    durable: Arc<dyn CounterStore>,
    primary: Option<Arc<dyn CounterStore>>,
}

// ============================================================================
// Builder Implementation
// ============================================================================

/// A type-safe builder for constructing [`Portcullis`] instances.
///
/// # Type States
///
/// - [`NoStore`]: Initial state, a store must be configured
/// - [`WithStore`]: Store configured, ready to build or add more configuration
///
/// The clock is fixed before the store is chosen, since stores compute
/// windows and expiry from it.
pub struct PortcullisBuilder<Store> {
    store: Store,
    clock: Arc<dyn Clock>,
    login_security_config: LoginSecurityConfig,
    session_config: SessionConfig,
    store_config: StoreConfig,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    apply_migrations: bool,
}

impl Default for PortcullisBuilder<NoStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl PortcullisBuilder<NoStore> {
    /// Create a new builder with default configuration.
    ///
    /// # Defaults
    ///
    /// - Clock: system time
    /// - Lockout: 5 attempts per 15 minutes, captcha after 3, IP block after 10
    /// - Sessions: 24 hours, remember-me tokens 30 days
    /// - Apply migrations: false
    pub fn new() -> Self {
        Self {
            store: NoStore,
            clock: system_clock(),
            login_security_config: LoginSecurityConfig::default(),
            session_config: SessionConfig::default(),
            store_config: StoreConfig::default(),
            captcha: None,
            apply_migrations: false,
        }
    }

    /// Use a different time source. Tests pass a `ManualClock` here.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the store configuration. Call this before [`Self::with_redis`] so
    /// the Redis write index uses the configured namespace.
    pub fn with_store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Keep all state in process memory.
    ///
    /// Nothing survives a restart and nothing is shared between processes.
    pub fn with_memory_store(self) -> PortcullisBuilder<WithStore> {
        let durable = Arc::new(MemoryCounterStore::durable(self.clock.clone()));
        let primary: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(self.clock.clone()));
        self.into_store(WithStore {
            durable,
            primary: Some(primary),
        })
    }

    /// Use any [`CounterStore`] as the durable store.
    pub fn with_store(self, durable: Arc<dyn CounterStore>) -> PortcullisBuilder<WithStore> {
        self.into_store(WithStore {
            durable,
            primary: None,
        })
    }

    fn into_store(self, store: WithStore) -> PortcullisBuilder<WithStore> {
        PortcullisBuilder {
            store,
            clock: self.clock,
            login_security_config: self.login_security_config,
            session_config: self.session_config,
            store_config: self.store_config,
            captcha: self.captcha,
            apply_migrations: self.apply_migrations,
        }
    }
}

// ============================================================================
// Store Configuration Methods (NoStore -> WithStore)
// ============================================================================

#[cfg(feature = "sqlite")]
impl PortcullisBuilder<NoStore> {
    /// Configure SQLite as the durable store by connecting to the given URL.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL (e.g., "sqlite::memory:" or "sqlite://path/to/db.sqlite")
    pub async fn with_sqlite(
        self,
        url: &str,
    ) -> Result<PortcullisBuilder<WithStore>, PortcullisBuilderError> {
        let store = crate::sqlite::SqliteCounterStore::connect(url, self.clock.clone())
            .await
            .map_err(|e| PortcullisBuilderError::StoreConnection(e.to_string()))?;
        Ok(self.with_store(Arc::new(store)))
    }

    /// Configure SQLite as the durable store with an existing connection pool.
    ///
    /// Use this when you already have a SQLite connection pool and want to
    /// share it with Portcullis.
    pub fn with_sqlite_pool(self, pool: sqlx::SqlitePool) -> PortcullisBuilder<WithStore> {
        let store = crate::sqlite::SqliteCounterStore::new(pool, self.clock.clone());
        self.with_store(Arc::new(store))
    }
}

// ============================================================================
// Configuration Methods (available after the store is configured)
// ============================================================================

#[cfg(feature = "redis")]
impl PortcullisBuilder<WithStore> {
    /// Put a Redis (or Dragonfly) server in front of the durable store.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn with_redis(self, url: &str) -> Result<Self, PortcullisBuilderError> {
        let store = crate::redis::RedisCounterStore::connect(
            url,
            &self.store_config.namespace,
            self.clock.clone(),
        )
        .await
        .map_err(|e| PortcullisBuilderError::StoreConnection(e.to_string()))?;
        Ok(self.with_primary_store(Arc::new(store)))
    }
}

impl PortcullisBuilder<WithStore> {
    /// Serve requests from `primary` instead of the durable store.
    pub fn with_primary_store(mut self, primary: Arc<dyn CounterStore>) -> Self {
        self.store.primary = Some(primary);
        self
    }

    /// Drop any primary store so the durable store serves every request.
    pub fn without_primary_store(mut self) -> Self {
        self.store.primary = None;
        self
    }

    /// Configure lockout, IP blocking, delays, captcha and risk weights.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use portcullis::{PortcullisBuilder, LoginSecurityConfig};
    /// use chrono::Duration;
    ///
    /// let builder = PortcullisBuilder::new()
    ///     .with_memory_store()
    ///     .with_login_security_config(LoginSecurityConfig {
    ///         max_attempts: 3,
    ///         lockout_duration: Duration::minutes(30),
    ///         captcha_threshold: 2,
    ///         ..Default::default()
    ///     });
    /// ```
    pub fn with_login_security_config(mut self, config: LoginSecurityConfig) -> Self {
        self.login_security_config = config;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn with_store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Verify captcha tokens once an identifier crosses the captcha threshold.
    ///
    /// Required while captcha escalation is enabled. Set `captcha_threshold`
    /// to 0 to build without one.
    pub fn with_captcha_verifier(mut self, verifier: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(verifier);
        self
    }

    /// Set whether to apply store migrations during build.
    ///
    /// Default: false
    pub fn apply_migrations(mut self, apply: bool) -> Self {
        self.apply_migrations = apply;
        self
    }

    /// Build the Portcullis instance.
    ///
    /// The store is selected once here: the primary if one is configured,
    /// otherwise the durable store.
    pub async fn build(
        self,
        credentials: Arc<dyn CredentialVerifier>,
        users: Arc<dyn UserLookup>,
    ) -> Result<Portcullis, PortcullisBuilderError> {
        let config = &self.login_security_config;
        if config.enabled && config.captcha_threshold >= config.max_attempts {
            return Err(PortcullisBuilderError::InvalidConfiguration(format!(
                "captcha threshold ({}) must be below max attempts ({})",
                config.captcha_threshold, config.max_attempts
            )));
        }
        if config.enabled && config.captcha_threshold > 0 && self.captcha.is_none() {
            return Err(PortcullisBuilderError::InvalidConfiguration(format!(
                "captcha threshold ({}) is set but no captcha verifier is configured",
                config.captcha_threshold
            )));
        }
        if self.store_config.namespace.is_empty() {
            return Err(PortcullisBuilderError::InvalidConfiguration(
                "store namespace must not be empty".to_string(),
            ));
        }

        let store = select_store(self.store.primary, self.store.durable);
        let store = StoreClient::new(store, &self.store_config);

        if self.apply_migrations {
            store
                .migrate()
                .await
                .map_err(|e| PortcullisBuilderError::Migration(e.to_string()))?;
        }

        Ok(Portcullis::from_builder(
            store,
            self.login_security_config,
            self.session_config,
            self.clock,
            credentials,
            users,
            self.captcha,
        ))
    }
}
