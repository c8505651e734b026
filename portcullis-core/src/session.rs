//! Session types
//!
//! A session ties an authenticated user to one device and one expiry. The
//! record is stored as JSON keyed by its id:
//!
//! | Field                | Type           | Description                                         |
//! | -------------------- | -------------- | --------------------------------------------------- |
//! | `id`                 | `SessionId`    | 64 hex characters from the OS CSPRNG.               |
//! | `user_id`            | `UserId`       | The user the session belongs to.                    |
//! | `device_fingerprint` | `String`       | Fingerprint of the device that created the session. |
//! | `ip_address`         | `String`       | Client IP at creation.                              |
//! | `user_agent`         | `Option`       | Client user agent at creation.                      |
//! | `login_type`         | `LoginType`    | How the user authenticated.                         |
//! | `security_level`     | `SecurityLevel`| Assurance level of the authentication.              |
//! | `remember_me`        | `bool`         | Whether a remember-me token was minted alongside.   |
//! | `created_at`         | `DateTime`     | When the session was created.                       |
//! | `updated_at`         | `DateTime`     | When the session was last refreshed.                |
//! | `expires_at`         | `DateTime`     | Instant after which the session is invalid.         |
//! | `max_age`            | `Duration`     | Lifetime granted at the last create or refresh.     |
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, crypto::generate_hex_id, user::UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: &str) -> Self {
        SessionId(id.to_string())
    }

    /// A fresh random id: 32 bytes from the OS CSPRNG, hex encoded.
    pub fn generate() -> Result<Self, Error> {
        Ok(SessionId(generate_hex_id()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// A short prefix safe to put in logs.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{prefix}...")
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client signals captured by the route layer for the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP, already resolved through any trusted proxy header.
    pub ip: String,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub accept_encoding: Option<String>,
}

impl RequestContext {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_accept_language(mut self, accept_language: impl Into<String>) -> Self {
        self.accept_language = Some(accept_language.into());
        self
    }

    pub fn with_accept_encoding(mut self, accept_encoding: impl Into<String>) -> Self {
        self.accept_encoding = Some(accept_encoding.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginType {
    #[default]
    Password,
    RememberMe,
    TwoFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Low,
    Standard,
    High,
}

impl From<LoginType> for SecurityLevel {
    fn from(login_type: LoginType) -> Self {
        match login_type {
            LoginType::Password => SecurityLevel::Standard,
            LoginType::RememberMe => SecurityLevel::Low,
            LoginType::TwoFactor => SecurityLevel::High,
        }
    }
}

/// Options for creating or refreshing a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub login_type: LoginType,
    /// Mint a remember-me token alongside the session.
    pub remember_me: bool,
    /// Requested lifetime; clamped into the configured bounds.
    pub max_age: Option<Duration>,
    /// Overrides the level implied by `login_type`.
    pub security_level: Option<SecurityLevel>,
}

impl SessionOptions {
    pub fn with_login_type(mut self, login_type: LoginType) -> Self {
        self.login_type = login_type;
        self
    }

    pub fn with_remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    pub fn effective_security_level(&self) -> SecurityLevel {
        self.security_level
            .unwrap_or_else(|| SecurityLevel::from(self.login_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub login_type: LoginType,
    pub security_level: SecurityLevel,
    pub remember_me: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "duration_seconds")]
    pub max_age: Duration,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A remember-me token in plaintext. Only ever handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberMeToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "duration_seconds")]
    pub max_age: Duration,
    pub device_fingerprint: String,
    pub remember_me_token: Option<RememberMeToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValidation {
    pub valid: bool,
    pub user_id: Option<UserId>,
    pub session: Option<Session>,
    pub reason: Option<String>,
    /// The request came from a different IP than the one the session was created from.
    pub ip_changed: bool,
    /// The IP change stayed inside the configured network segment.
    pub ip_change_allowed: bool,
    /// The request's device signals no longer match the session's fingerprint.
    pub fingerprint_changed: bool,
}

impl SessionValidation {
    pub const NOT_FOUND_OR_EXPIRED: &'static str = "not found or expired";
    pub const IP_CHANGE_REJECTED: &'static str = "ip address changed";

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            user_id: None,
            session: None,
            reason: Some(reason.into()),
            ip_changed: false,
            ip_change_allowed: false,
            fingerprint_changed: false,
        }
    }

    pub fn not_found_or_expired() -> Self {
        Self::invalid(Self::NOT_FOUND_OR_EXPIRED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshedSession {
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "duration_seconds")]
    pub max_age: Duration,
}

/// Result of a destroy call. Destroying something already gone is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DestroyedSessions {
    pub destroyed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberMeValidation {
    pub valid: bool,
    pub user_id: Option<UserId>,
    pub device_fingerprint: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl RememberMeValidation {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            user_id: None,
            device_fingerprint: None,
            expires_at: None,
            reason: Some(reason.into()),
        }
    }
}

pub(crate) mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = SessionId::generate().unwrap();
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.redacted().len(), 11);
    }

    #[test]
    fn test_session_ids_do_not_repeat() {
        let ids: HashSet<SessionId> = (0..10_000).map(|_| SessionId::generate().unwrap()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_security_level_follows_login_type() {
        assert_eq!(
            SessionOptions::default().effective_security_level(),
            SecurityLevel::Standard
        );
        assert_eq!(
            SessionOptions::default()
                .with_login_type(LoginType::TwoFactor)
                .effective_security_level(),
            SecurityLevel::High
        );
        assert_eq!(
            SessionOptions::default()
                .with_login_type(LoginType::RememberMe)
                .with_security_level(SecurityLevel::High)
                .effective_security_level(),
            SecurityLevel::High
        );
    }

    #[test]
    fn test_session_serializes_max_age_in_seconds() {
        let now = Utc::now();
        let session = Session {
            id: SessionId::new("abc"),
            user_id: UserId::new("usr_1"),
            device_fingerprint: "fp".to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: None,
            login_type: LoginType::Password,
            security_level: SecurityLevel::Standard,
            remember_me: false,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(24),
            max_age: Duration::hours(24),
        };

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["max_age"], 86_400);
        assert_eq!(json["login_type"], "password");

        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back, session);
        assert!(!back.is_expired(now));
        assert!(back.is_expired(now + Duration::hours(24)));
    }
}
