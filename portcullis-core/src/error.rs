use chrono::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// The counter or session store could not be reached, or did not answer in time.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found or expired")]
    NotFoundOrExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Account temporarily locked, try again in {} seconds", .remaining.num_seconds())]
    Locked { remaining: Duration },

    #[error("Too many attempts from this address, try again in {} seconds", .remaining.num_seconds())]
    IpBlocked { remaining: Duration },

    #[error("Too many attempts, try again in {} ms", .retry_after.num_milliseconds())]
    RateLimitExceeded { retry_after: Duration },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl Error {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Unavailable(_)))
    }

    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_session_error(&self) -> bool {
        matches!(self, Error::Session(_))
    }

    pub fn is_security_error(&self) -> bool {
        matches!(self, Error::Security(_))
    }

    pub fn is_not_found_or_expired(&self) -> bool {
        matches!(self, Error::Session(SessionError::NotFoundOrExpired))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(StorageError::Serialization(e.to_string()))
    }
}
