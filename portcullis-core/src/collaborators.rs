//! Interfaces to the systems portcullis relies on but does not implement
//!
//! Password storage, user accounts and captcha providers live outside this
//! crate. Applications plug them in through these traits.

use async_trait::async_trait;

use crate::{Error, user::UserRecord};

/// Outcome of checking a password for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid,
    InvalidPassword,
    UnknownIdentifier,
}

/// Checks an identifier and password against the application's credential store.
///
/// Portcullis never hashes or stores passwords itself.
#[async_trait]
pub trait CredentialVerifier: Send + Sync + 'static {
    async fn verify(&self, identifier: &str, password: &str) -> Result<CredentialCheck, Error>;
}

/// Resolves a login identifier to the user it belongs to.
#[async_trait]
pub trait UserLookup: Send + Sync + 'static {
    async fn find_user(&self, identifier: &str) -> Result<Option<UserRecord>, Error>;
}

/// Verifies a captcha response token with the captcha provider.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync + 'static {
    async fn verify(&self, token: &str, ip: &str) -> Result<bool, Error>;
}
