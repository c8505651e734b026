//! Key layout in the counter store
//!
//! Every concern gets its own key prefix so that no two kinds of record can
//! collide, whatever the identifier, IP or user id contains:
//!
//! | Key                                        | Holds                                 |
//! | ------------------------------------------ | ------------------------------------- |
//! | `<ns>:identifier-failures:<identifier>`    | failure counter per login identifier  |
//! | `<ns>:ip-failures:<ip>`                    | failure counter per client IP         |
//! | `<ns>:ip-block:<ip>`                       | IP block marker (blocked-at, millis)  |
//! | `<ns>:identifier-user:<identifier>`        | user id last logged in as identifier  |
//! | `<ns>:device:<user_id>:<fingerprint>`      | device counter (login count, seen at) |
//! | `<ns>:session:<session_id>`                | session record (JSON)                 |
//! | `<ns>:user-sessions:<user_id>`             | set of session ids for a user         |
//! | `<ns>:remember-me:<sha256(token)>`         | remember-me payload (JSON)            |

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, kind: &str, rest: &str) -> String {
        format!("{}:{kind}:{rest}", self.namespace)
    }

    pub fn identifier_failures(&self, identifier: &str) -> String {
        self.key("identifier-failures", identifier)
    }

    pub fn ip_failures(&self, ip: &str) -> String {
        self.key("ip-failures", ip)
    }

    pub fn ip_block(&self, ip: &str) -> String {
        self.key("ip-block", ip)
    }

    pub fn identifier_user(&self, identifier: &str) -> String {
        self.key("identifier-user", identifier)
    }

    pub fn device(&self, user_id: &str, fingerprint: &str) -> String {
        self.key("device", &format!("{user_id}:{fingerprint}"))
    }

    pub fn session(&self, session_id: &str) -> String {
        self.key("session", session_id)
    }

    pub fn session_prefix(&self) -> String {
        self.key("session", "")
    }

    pub fn user_sessions(&self, user_id: &str) -> String {
        self.key("user-sessions", user_id)
    }

    pub fn user_sessions_prefix(&self) -> String {
        self.key("user-sessions", "")
    }

    pub fn remember_me(&self, token_hash: &str) -> String {
        self.key("remember-me", token_hash)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("portcullis")
    }
}
