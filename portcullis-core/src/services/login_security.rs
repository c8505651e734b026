//! Login security engine: lockout, IP blocking, progressive delay and device risk.
//!
//! All state lives in the counter store as windowed counters, so several
//! processes sharing one store see the same lockouts. Every mutation is a
//! single atomic store call; nothing here does read-modify-write.
//!
//! # Gates
//!
//! A login attempt passes through two independent gates before any password is
//! checked:
//!
//! - the **identifier lockout**, shut once an identifier collects
//!   `max_attempts` failures within its window, for `lockout_duration` measured
//!   from the window start;
//! - the **IP block**, shut once an IP collects `ip_max_attempts` failures
//!   across any identifiers, for `ip_block_duration` from the moment the
//!   threshold was crossed.
//!
//! Lockout is evaluated first so the caller can give the more specific message.
//! On top of the gates, a progressive delay throttles retries and a captcha is
//! demanded from `captcha_threshold` failures on.
//!
//! # Store failures
//!
//! Reads and writes propagate [`StorageError::Unavailable`]. Recording a failure
//! never pretends to succeed. Callers that need a decision regardless should go
//! through [`SecurityContextAssembler`], which treats an unreadable store as a
//! shut gate.
//!
//! # Example
//!
//! ```rust,ignore
//! use portcullis_core::services::LoginSecurityService;
//! use portcullis_core::FailureReason;
//!
//! let context = engine.check_login_allowed(ip, "user@example.com", &fingerprint).await?;
//!
//! // ...password check fails...
//! engine
//!     .record_failed_attempt(ip, "user@example.com", FailureReason::InvalidPassword)
//!     .await?;
//! ```
//!
//! [`StorageError::Unavailable`]: crate::error::StorageError::Unavailable
//! [`SecurityContextAssembler`]: super::SecurityContextAssembler

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    Error,
    clock::Clock,
    config::LoginSecurityConfig,
    error::{SecurityError, StorageError},
    security::{
        AttemptOutcome, DelayInfo, DeviceRecord, FailureReason, IpBlockInfo, LockoutInfo,
        SecurityContext, SuspiciousActivity,
    },
    storage::{CounterSnapshot, StoreClient},
    user::UserId,
};

/// Window used for device counters. Long enough that `first_seen` survives for
/// as long as the device keeps logging in; the record itself expires after
/// `device_retention` of inactivity.
const DEVICE_WINDOW_DAYS: i64 = 365 * 100;

/// Reason attached to logins from a fingerprint never seen for the user.
pub const NEW_DEVICE_REASON: &str = "new device";

pub struct LoginSecurityService {
    store: StoreClient,
    config: LoginSecurityConfig,
    clock: Arc<dyn Clock>,
}

impl LoginSecurityService {
    pub fn new(store: StoreClient, config: LoginSecurityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LoginSecurityConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Identifiers are compared case-insensitively and without surrounding whitespace.
    pub fn normalize_identifier(identifier: &str) -> String {
        identifier.trim().to_lowercase()
    }

    /// Record a failed login attempt against both the identifier and the IP.
    ///
    /// The reason is written to the audit log only. If the store cannot take the
    /// increment the call fails: a failure that is not counted must not look
    /// like one that was.
    pub async fn record_failed_attempt(
        &self,
        ip: &str,
        identifier: &str,
        reason: FailureReason,
    ) -> Result<AttemptOutcome, Error> {
        if !self.config.enabled {
            return Ok(AttemptOutcome {
                identifier_attempts: 0,
                ip_attempts: 0,
                locked: false,
                ip_blocked: false,
                captcha_required: false,
            });
        }

        let identifier = Self::normalize_identifier(identifier);
        let keys = self.store.keys();

        let identifier_count = self
            .store
            .increment(
                &keys.identifier_failures(&identifier),
                self.config.identifier_reset_window(),
                self.config.identifier_record_ttl(),
            )
            .await?
            .count;

        let ip_count = self
            .store
            .increment(
                &keys.ip_failures(ip),
                self.config.ip_attempt_window,
                self.config.ip_record_ttl(),
            )
            .await?
            .count;

        tracing::info!(
            ip,
            identifier = %identifier,
            reason = %reason,
            identifier_attempts = identifier_count,
            ip_attempts = ip_count,
            "Recorded failed login attempt"
        );

        let locked = identifier_count == self.config.max_attempts;
        if locked {
            tracing::warn!(
                identifier = %identifier,
                ip,
                lockout_secs = self.config.lockout_duration.num_seconds(),
                "Identifier locked after repeated failed logins"
            );
        }

        let mut ip_blocked = false;
        if ip_count >= self.config.ip_max_attempts {
            let blocked_at = self.clock.now().timestamp_millis().to_string();
            ip_blocked = self
                .store
                .set_if_absent(
                    &keys.ip_block(ip),
                    &blocked_at,
                    self.config.ip_block_duration,
                )
                .await?;
            if ip_blocked {
                tracing::warn!(
                    ip,
                    ip_attempts = ip_count,
                    block_secs = self.config.ip_block_duration.num_seconds(),
                    "IP blocked after repeated failed logins"
                );
            }
        }

        Ok(AttemptOutcome {
            identifier_attempts: identifier_count,
            ip_attempts: ip_count,
            locked,
            ip_blocked,
            captcha_required: self.captcha_due(identifier_count),
        })
    }

    /// Record a successful login.
    ///
    /// Clears the identifier's failures (and with them its delay), remembers
    /// which user the identifier belongs to, and counts the login against the
    /// device. The IP counter is left alone.
    pub async fn record_successful_login(
        &self,
        ip: &str,
        identifier: &str,
        user_id: &UserId,
        device_fingerprint: Option<&str>,
    ) -> Result<(), Error> {
        if !self.config.enabled {
            return Ok(());
        }

        let identifier = Self::normalize_identifier(identifier);
        let keys = self.store.keys();

        self.store
            .delete(&keys.identifier_failures(&identifier))
            .await?;
        self.store
            .set(
                &keys.identifier_user(&identifier),
                user_id.as_str(),
                self.config.device_retention,
            )
            .await?;

        let login_count = match device_fingerprint {
            Some(fingerprint) => Some(
                self.store
                    .increment(
                        &keys.device(user_id.as_str(), fingerprint),
                        Duration::days(DEVICE_WINDOW_DAYS),
                        self.config.device_retention,
                    )
                    .await?
                    .count,
            ),
            None => None,
        };

        tracing::info!(
            ip,
            identifier = %identifier,
            user_id = %user_id,
            device_logins = ?login_count,
            "Recorded successful login"
        );
        Ok(())
    }

    async fn identifier_counter(&self, identifier: &str) -> Result<Option<CounterSnapshot>, Error> {
        let identifier = Self::normalize_identifier(identifier);
        self.store
            .counter(&self.store.keys().identifier_failures(&identifier))
            .await
    }

    fn active_identifier_count(&self, snapshot: Option<&CounterSnapshot>, now: DateTime<Utc>) -> u32 {
        snapshot.map_or(0, |s| {
            s.active_count(self.config.identifier_reset_window(), now)
        })
    }

    fn captcha_due(&self, identifier_attempts: u32) -> bool {
        self.config.enabled
            && self.config.captcha_threshold > 0
            && identifier_attempts >= self.config.captcha_threshold
    }

    /// Failures counted for the identifier in its current window.
    ///
    /// The IP's own tally is [`get_ip_attempts`](Self::get_ip_attempts).
    pub async fn get_failed_attempts(&self, ip: &str, identifier: &str) -> Result<u32, Error> {
        if !self.config.enabled {
            return Ok(0);
        }
        let snapshot = self.identifier_counter(identifier).await?;
        let count = self.active_identifier_count(snapshot.as_ref(), self.clock.now());
        tracing::debug!(ip, identifier, count, "Read failed attempts");
        Ok(count)
    }

    pub async fn is_user_locked(&self, identifier: &str) -> Result<bool, Error> {
        Ok(self.get_lockout_info(identifier).await?.is_locked)
    }

    pub async fn get_lockout_info(&self, identifier: &str) -> Result<LockoutInfo, Error> {
        let max_attempts = self.config.max_attempts;
        if !self.config.enabled {
            return Ok(LockoutInfo::unlocked(0, max_attempts));
        }

        let now = self.clock.now();
        let Some(snapshot) = self.identifier_counter(identifier).await? else {
            return Ok(LockoutInfo::unlocked(0, max_attempts));
        };

        let attempts = self.active_identifier_count(Some(&snapshot), now);
        let locked_until = snapshot.window_start + self.config.lockout_duration;
        if attempts >= max_attempts && now < locked_until {
            Ok(LockoutInfo {
                is_locked: true,
                attempts,
                attempts_remaining: 0,
                locked_until: Some(locked_until),
                remaining_time: locked_until - now,
            })
        } else {
            Ok(LockoutInfo::unlocked(attempts, max_attempts))
        }
    }

    /// Failures counted for the IP in its current window, across all identifiers.
    pub async fn get_ip_attempts(&self, ip: &str) -> Result<u32, Error> {
        if !self.config.enabled {
            return Ok(0);
        }
        let now = self.clock.now();
        let snapshot = self
            .store
            .counter(&self.store.keys().ip_failures(ip))
            .await?;
        Ok(snapshot.map_or(0, |s| s.active_count(self.config.ip_attempt_window, now)))
    }

    pub async fn is_ip_blocked(&self, ip: &str) -> Result<bool, Error> {
        Ok(self.get_ip_block_info(ip).await?.is_blocked)
    }

    pub async fn get_ip_block_info(&self, ip: &str) -> Result<IpBlockInfo, Error> {
        let attempts = self.get_ip_attempts(ip).await?;
        let unblocked = IpBlockInfo {
            is_blocked: false,
            attempts,
            blocked_until: None,
            remaining_time: Duration::zero(),
        };
        if !self.config.enabled {
            return Ok(unblocked);
        }

        let Some(marker) = self.store.get(&self.store.keys().ip_block(ip)).await? else {
            return Ok(unblocked);
        };
        let blocked_at = marker
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| {
                StorageError::Serialization(format!("malformed IP block marker: {marker}"))
            })?;

        let now = self.clock.now();
        let blocked_until = blocked_at + self.config.ip_block_duration;
        if now < blocked_until {
            Ok(IpBlockInfo {
                is_blocked: true,
                attempts,
                blocked_until: Some(blocked_until),
                remaining_time: blocked_until - now,
            })
        } else {
            Ok(unblocked)
        }
    }

    /// The progressive delay owed by the identifier.
    ///
    /// Zero for identifiers with no failures and immediately after a success.
    pub async fn get_delay_info(&self, ip: &str, identifier: &str) -> Result<DelayInfo, Error> {
        if !self.config.enabled {
            return Ok(DelayInfo::default());
        }

        let now = self.clock.now();
        let Some(snapshot) = self.identifier_counter(identifier).await? else {
            return Ok(DelayInfo::default());
        };
        let delay = self
            .config
            .delay
            .delay_for(self.active_identifier_count(Some(&snapshot), now));
        let retry_after = (snapshot.last_updated + delay - now).max(Duration::zero());

        tracing::debug!(ip, identifier, delay_ms = delay.num_milliseconds(), "Read delay");
        Ok(DelayInfo {
            delay_ms: millis(delay),
            retry_after_ms: millis(retry_after),
        })
    }

    pub async fn is_captcha_required(&self, ip: &str, identifier: &str) -> Result<bool, Error> {
        let attempts = self.get_failed_attempts(ip, identifier).await?;
        Ok(self.captcha_due(attempts))
    }

    pub async fn get_device_info(
        &self,
        user_id: &UserId,
        device_fingerprint: &str,
    ) -> Result<Option<DeviceRecord>, Error> {
        let snapshot = self
            .store
            .counter(&self.store.keys().device(user_id.as_str(), device_fingerprint))
            .await?;

        Ok(snapshot.map(|s| DeviceRecord {
            user_id: user_id.clone(),
            fingerprint: device_fingerprint.to_string(),
            first_seen: s.window_start,
            last_seen: s.last_updated,
            login_count: s.count,
        }))
    }

    /// Compare the presented fingerprint with the devices known for the user.
    ///
    /// An unseen fingerprint is suspicious whatever the IP; a known one never is.
    pub async fn check_suspicious_activity(
        &self,
        ip: &str,
        identifier: &str,
        device_fingerprint: &str,
        user_id: &UserId,
    ) -> Result<SuspiciousActivity, Error> {
        if !self.config.enabled {
            return Ok(SuspiciousActivity::clear());
        }

        match self.get_device_info(user_id, device_fingerprint).await? {
            Some(_) => Ok(SuspiciousActivity::clear()),
            None => {
                tracing::warn!(
                    ip,
                    identifier,
                    user_id = %user_id,
                    "Login from a device not seen for this user"
                );
                Ok(SuspiciousActivity::flagged(NEW_DEVICE_REASON))
            }
        }
    }

    /// Whether the fingerprint is new for whichever user last logged in as `identifier`.
    async fn is_new_device(&self, identifier: &str, device_fingerprint: &str) -> Result<bool, Error> {
        let identifier = Self::normalize_identifier(identifier);
        let owner = self
            .store
            .get(&self.store.keys().identifier_user(&identifier))
            .await?;
        match owner {
            Some(user_id) => Ok(self
                .get_device_info(&UserId::from(user_id), device_fingerprint)
                .await?
                .is_none()),
            None => Ok(true),
        }
    }

    /// Everything the login route needs before checking a password, in one read.
    pub async fn get_security_context(
        &self,
        ip: &str,
        identifier: &str,
        device_fingerprint: &str,
    ) -> Result<SecurityContext, Error> {
        if !self.config.enabled {
            return Ok(SecurityContext::open(self.config.max_attempts));
        }

        let lockout = self.get_lockout_info(identifier).await?;
        let ip_block = self.get_ip_block_info(ip).await?;
        let delay = self.get_delay_info(ip, identifier).await?;
        let is_new_device = self.is_new_device(identifier, device_fingerprint).await?;

        Ok(SecurityContext {
            risk_score: self.risk_score(&lockout, &ip_block, is_new_device),
            requires_captcha: self.captcha_due(lockout.attempts),
            is_locked: lockout.is_locked,
            is_ip_blocked: ip_block.is_blocked,
            delay_ms: delay.delay_ms,
            retry_after_ms: delay.retry_after_ms,
            attempts_remaining: lockout.attempts_remaining,
            is_new_device,
            locked_until: lockout.locked_until,
            ip_blocked_until: ip_block.blocked_until,
            degraded: false,
        })
    }

    /// Combine lockout proximity, IP reputation and device novelty into 0..=100.
    ///
    /// Each signal contributes its weight scaled by how close it is to its
    /// threshold, so the score never decreases as any signal grows.
    fn risk_score(&self, lockout: &LockoutInfo, ip_block: &IpBlockInfo, is_new_device: bool) -> u8 {
        let weights = &self.config.risk;

        let lockout_signal = if lockout.is_locked {
            1.0
        } else {
            ratio(lockout.attempts, self.config.max_attempts)
        };
        let ip_signal = if ip_block.is_blocked {
            1.0
        } else {
            ratio(ip_block.attempts, self.config.ip_max_attempts)
        };
        let device_signal = if is_new_device { 1.0 } else { 0.0 };

        let score = f64::from(weights.lockout) * lockout_signal
            + f64::from(weights.ip) * ip_signal
            + f64::from(weights.new_device) * device_signal;
        score.round().clamp(0.0, 100.0) as u8
    }

    /// Check both gates and the delay, in that order.
    ///
    /// Returns the security context when the attempt may go ahead.
    pub async fn check_login_allowed(
        &self,
        ip: &str,
        identifier: &str,
        device_fingerprint: &str,
    ) -> Result<SecurityContext, Error> {
        let context = self
            .get_security_context(ip, identifier, device_fingerprint)
            .await?;
        let now = self.clock.now();

        if context.is_locked {
            let remaining = context
                .locked_until
                .map_or(Duration::zero(), |until| (until - now).max(Duration::zero()));
            return Err(SecurityError::Locked { remaining }.into());
        }
        if context.is_ip_blocked {
            let remaining = context
                .ip_blocked_until
                .map_or(Duration::zero(), |until| (until - now).max(Duration::zero()));
            return Err(SecurityError::IpBlocked { remaining }.into());
        }
        if context.retry_after_ms > 0 {
            return Err(SecurityError::RateLimitExceeded {
                retry_after: Duration::milliseconds(context.retry_after_ms as i64),
            }
            .into());
        }
        Ok(context)
    }

    /// Clear an identifier's failures. Returns whether it was locked.
    pub async fn unlock_identifier(&self, identifier: &str) -> Result<bool, Error> {
        let was_locked = self.is_user_locked(identifier).await?;
        let identifier = Self::normalize_identifier(identifier);
        self.store
            .delete(&self.store.keys().identifier_failures(&identifier))
            .await?;
        if was_locked {
            tracing::info!(identifier = %identifier, "Identifier unlocked");
        }
        Ok(was_locked)
    }

    /// Lift an IP block and clear the IP's failures. Returns whether it was blocked.
    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, Error> {
        let was_blocked = self.is_ip_blocked(ip).await?;
        let keys = self.store.keys();
        self.store.delete(&keys.ip_block(ip)).await?;
        self.store.delete(&keys.ip_failures(ip)).await?;
        if was_blocked {
            tracing::info!(ip, "IP unblocked");
        }
        Ok(was_blocked)
    }

    /// Force-expire every record last written before `before`.
    pub async fn expire_old_data(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let removed = self.store.expire_before(before).await?;
        tracing::info!(removed, %before, "Expired old security records");
        Ok(removed)
    }
}

fn ratio(count: u32, threshold: u32) -> f64 {
    if threshold == 0 {
        return 0.0;
    }
    (f64::from(count) / f64::from(threshold)).min(1.0)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.num_milliseconds()).unwrap_or(0)
}
