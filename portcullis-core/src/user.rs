//! User identity as seen by the security core
//!
//! Portcullis never owns user accounts. It only needs a stable identifier to
//! attribute sessions and device records to, and the role reported by the
//! user-lookup collaborator.
//!
//! | Field  | Type     | Description                                      |
//! | ------ | -------- | ------------------------------------------------ |
//! | `id`   | `UserId` | The unique identifier for the user.              |
//! | `role` | `String` | The user's role as reported by the user service. |
use serde::{Deserialize, Serialize};

/// A unique, stable identifier for a specific user
/// This value should be treated as opaque
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: &str) -> Self {
        UserId(id.to_string())
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user resolved from a login identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub role: String,
}

impl UserRecord {
    pub fn new(id: impl Into<UserId>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_round_trips_as_plain_string() {
        let id = UserId::new("usr_123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"usr_123\"");
        assert_eq!(serde_json::from_str::<UserId>(&json).unwrap(), id);
    }

    #[test]
    fn test_user_record_new() {
        let user = UserRecord::new("usr_1", "admin");
        assert_eq!(user.id.as_str(), "usr_1");
        assert_eq!(user.role, "admin");
    }
}
