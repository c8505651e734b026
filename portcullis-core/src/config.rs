//! Policy configuration for login security, sessions and store access
//!
//! Thresholds and windows are policy, not code: every value here has a default
//! matching common deployments and can be overridden field by field.

use chrono::Duration;

/// Configuration for the login security engine.
///
/// # Example
///
/// ```rust
/// use portcullis_core::LoginSecurityConfig;
/// use chrono::Duration;
///
/// let config = LoginSecurityConfig {
///     max_attempts: 3,
///     lockout_duration: Duration::minutes(30),
///     ..Default::default()
/// };
/// assert!(config.captcha_threshold < config.max_attempts);
/// ```
#[derive(Debug, Clone)]
pub struct LoginSecurityConfig {
    /// When false, every gate is open and nothing is recorded.
    pub enabled: bool,
    /// Failures per identifier before the identifier is locked.
    pub max_attempts: u32,
    /// Length of the fixed window failures are counted in, measured from the first failure.
    pub attempt_window: Duration,
    /// How long a lockout lasts, measured from the window start.
    pub lockout_duration: Duration,
    /// Failures per identifier before a captcha is demanded. Must be below `max_attempts`.
    pub captcha_threshold: u32,
    /// Failures per IP, across all identifiers, before the IP is blocked.
    pub ip_max_attempts: u32,
    /// Counting window for per-IP failures.
    pub ip_attempt_window: Duration,
    /// How long an IP block lasts once the threshold is crossed.
    pub ip_block_duration: Duration,
    /// Minimum lifetime of failure records in the store.
    pub record_ttl: Duration,
    /// How long a device stays "known" after its last successful login.
    pub device_retention: Duration,
    pub delay: DelayPolicy,
    pub risk: RiskWeights,
}

impl Default for LoginSecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            attempt_window: Duration::minutes(15),
            lockout_duration: Duration::minutes(15),
            captcha_threshold: 3,
            ip_max_attempts: 10,
            ip_attempt_window: Duration::minutes(15),
            ip_block_duration: Duration::hours(1),
            record_ttl: Duration::hours(24),
            device_retention: Duration::days(90),
            delay: DelayPolicy::default(),
            risk: RiskWeights::default(),
        }
    }
}

impl LoginSecurityConfig {
    /// A configuration with all protection switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// The window after which an identifier's failure count starts over.
    ///
    /// A record never resets while it still holds an active lockout.
    pub fn identifier_reset_window(&self) -> Duration {
        self.attempt_window.max(self.lockout_duration)
    }

    /// Store TTL for identifier failure records, always longer than the lockout window.
    pub fn identifier_record_ttl(&self) -> Duration {
        self.record_ttl
            .max(self.identifier_reset_window() + self.lockout_duration)
    }

    /// Store TTL for IP failure records, always longer than the IP window.
    pub fn ip_record_ttl(&self) -> Duration {
        self.record_ttl
            .max(self.ip_attempt_window + self.ip_block_duration)
    }
}

/// Progressive backoff applied after consecutive failures.
///
/// The delay is zero until `after_attempts` failures have been seen, then
/// doubles with each further failure starting from `base_delay`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct DelayPolicy {
    pub after_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            after_attempts: 1,
            base_delay: Duration::seconds(1),
            max_delay: Duration::seconds(30),
        }
    }
}

impl DelayPolicy {
    /// The delay owed after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || failures < self.after_attempts {
            return Duration::zero();
        }

        let exponent = (failures - self.after_attempts).min(20);
        let multiplier = 1i64 << exponent;
        let delay_ms = self
            .base_delay
            .num_milliseconds()
            .saturating_mul(multiplier);

        Duration::milliseconds(delay_ms).min(self.max_delay)
    }
}

/// Weights of the three risk signals. The score is clamped to 0..=100.
#[derive(Debug, Clone)]
pub struct RiskWeights {
    /// Contribution at full lockout proximity.
    pub lockout: u8,
    /// Contribution of a blocked (or nearly blocked) IP.
    pub ip: u8,
    /// Contribution of a device never seen for the account.
    pub new_device: u8,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            lockout: 40,
            ip: 35,
            new_device: 25,
        }
    }
}

/// What to do when a session is presented from a different network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpChangePolicy {
    /// Ignore address changes entirely.
    Allow,
    /// Surface the change to the caller but keep the session valid.
    #[default]
    Flag,
    /// Reject sessions presented from outside the original network segment.
    Reject,
}

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub default_max_age: Duration,
    pub min_max_age: Duration,
    pub max_max_age: Duration,
    pub remember_me_max_age: Duration,
    pub ip_change_policy: IpChangePolicy,
    /// Prefix length treated as "the same network" for IPv4 addresses.
    pub ipv4_prefix: u8,
    /// Prefix length treated as "the same network" for IPv6 addresses.
    pub ipv6_prefix: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_max_age: Duration::hours(24),
            min_max_age: Duration::minutes(5),
            max_max_age: Duration::days(30),
            remember_me_max_age: Duration::days(30),
            ip_change_policy: IpChangePolicy::default(),
            ipv4_prefix: 24,
            ipv6_prefix: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_default_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    pub fn with_remember_me_max_age(mut self, max_age: Duration) -> Self {
        self.remember_me_max_age = max_age;
        self
    }

    pub fn with_ip_change_policy(mut self, policy: IpChangePolicy) -> Self {
        self.ip_change_policy = policy;
        self
    }

    /// Clamp a requested max age into the configured bounds.
    pub fn clamp_max_age(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_max_age)
            .clamp(self.min_max_age, self.max_max_age)
    }
}

/// Configuration for access to the counter store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefix applied to every key, separating deployments sharing one store.
    pub namespace: String,
    /// Upper bound on any single store call.
    pub operation_timeout: std::time::Duration,
    /// Pause before the single retry of a read or idempotent write.
    pub read_retry_backoff: std::time::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "portcullis".to_string(),
            operation_timeout: std::time::Duration::from_secs(2),
            read_retry_backoff: std::time::Duration::from_millis(50),
        }
    }
}

impl StoreConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_operation_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
