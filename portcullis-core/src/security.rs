//! Login security state as reported to callers
//!
//! None of these types are persisted. They are derived on each read from the
//! counters held in the store, so they always reflect the clock at the time of
//! the call.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::user::UserId;

/// Why a login attempt failed. Recorded for audit, never returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidPassword,
    InvalidIdentifier,
    CaptchaFailed,
    Other,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InvalidPassword => "invalid_password",
            FailureReason::InvalidIdentifier => "invalid_identifier",
            FailureReason::CaptchaFailed => "captcha_failed",
            FailureReason::Other => "other",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What recording a failed attempt did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Failures for the identifier in the current window, this one included.
    pub identifier_attempts: u32,
    /// Failures from the IP in the current window, this one included.
    pub ip_attempts: u32,
    /// This attempt pushed the identifier into lockout.
    pub locked: bool,
    /// This attempt pushed the IP into a block.
    pub ip_blocked: bool,
    pub captcha_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutInfo {
    pub is_locked: bool,
    pub attempts: u32,
    pub attempts_remaining: u32,
    pub locked_until: Option<DateTime<Utc>>,
    /// `max(0, locked_until - now)`, zero when not locked.
    #[serde(with = "duration_millis")]
    pub remaining_time: Duration,
}

impl LockoutInfo {
    pub fn unlocked(attempts: u32, max_attempts: u32) -> Self {
        Self {
            is_locked: false,
            attempts,
            attempts_remaining: max_attempts.saturating_sub(attempts),
            locked_until: None,
            remaining_time: Duration::zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlockInfo {
    pub is_blocked: bool,
    pub attempts: u32,
    pub blocked_until: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub remaining_time: Duration,
}

/// Progressive delay owed by an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DelayInfo {
    /// Delay the current failure count calls for.
    pub delay_ms: u64,
    /// Part of that delay still left, measured from the last failure.
    pub retry_after_ms: u64,
}

impl DelayInfo {
    pub fn retry_after(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.retry_after_ms).unwrap_or(i64::MAX))
    }
}

/// A device a user has successfully logged in from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user_id: UserId,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub login_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub is_suspicious: bool,
    pub reason: Option<String>,
}

impl SuspiciousActivity {
    pub fn clear() -> Self {
        Self {
            is_suspicious: false,
            reason: None,
        }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self {
            is_suspicious: true,
            reason: Some(reason.into()),
        }
    }
}

/// Everything the login route needs to know before checking a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// 0 (no signal) to 100 (every signal at full strength).
    pub risk_score: u8,
    pub requires_captcha: bool,
    pub is_locked: bool,
    pub is_ip_blocked: bool,
    pub delay_ms: u64,
    pub retry_after_ms: u64,
    pub attempts_remaining: u32,
    pub is_new_device: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub ip_blocked_until: Option<DateTime<Utc>>,
    /// Set when the context was produced without store access and every gate was forced shut.
    #[serde(default)]
    pub degraded: bool,
}

impl SecurityContext {
    /// The context used when the store cannot be read: every gate closed.
    pub fn fail_closed() -> Self {
        Self {
            risk_score: 100,
            requires_captcha: true,
            is_locked: true,
            is_ip_blocked: true,
            delay_ms: 0,
            retry_after_ms: 0,
            attempts_remaining: 0,
            is_new_device: true,
            locked_until: None,
            ip_blocked_until: None,
            degraded: true,
        }
    }

    /// A context with no recorded history, as returned while protection is disabled.
    pub fn open(attempts_remaining: u32) -> Self {
        Self {
            risk_score: 0,
            requires_captcha: false,
            is_locked: false,
            is_ip_blocked: false,
            delay_ms: 0,
            retry_after_ms: 0,
            attempts_remaining,
            is_new_device: false,
            locked_until: None,
            ip_blocked_until: None,
            degraded: false,
        }
    }

    /// Whether either hard gate is shut.
    pub fn is_blocked(&self) -> bool {
        self.is_locked || self.is_ip_blocked
    }
}

pub(crate) mod duration_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::milliseconds(i64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_strings() {
        assert_eq!(FailureReason::InvalidPassword.to_string(), "invalid_password");
        assert_eq!(
            serde_json::to_string(&FailureReason::InvalidIdentifier).unwrap(),
            "\"invalid_identifier\""
        );
    }

    #[test]
    fn test_fail_closed_shuts_every_gate() {
        let context = SecurityContext::fail_closed();
        assert!(context.is_blocked());
        assert!(context.is_locked && context.is_ip_blocked);
        assert!(context.requires_captcha);
        assert_eq!(context.risk_score, 100);
        assert!(context.degraded);
    }

    #[test]
    fn test_unlocked_lockout_info() {
        let info = LockoutInfo::unlocked(2, 5);
        assert!(!info.is_locked);
        assert_eq!(info.attempts_remaining, 3);
        assert_eq!(info.remaining_time, Duration::zero());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["remaining_time"], 0);
    }
}
