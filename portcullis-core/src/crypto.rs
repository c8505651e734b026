//! Randomness and hashing for session ids, tokens and fingerprints
//!
//! Session ids and remember-me tokens are drawn from the operating system's
//! CSPRNG. Remember-me tokens are only ever stored as SHA256 hashes and checked
//! with a constant-time comparison.

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use rand::{TryRngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, error::StorageError};

/// Length in characters of a URL-safe base64 encoding of 32 bytes.
pub const SECURE_TOKEN_LENGTH: usize = 43;

fn random_bytes<const N: usize>() -> Result<[u8; N], Error> {
    let mut bytes = [0u8; N];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        tracing::error!(error = %e, "OS random number generator failed");
        StorageError::Unavailable(format!("entropy source unavailable: {e}"))
    })?;
    Ok(bytes)
}

/// Generate 32 random bytes encoded as 64 lowercase hex characters.
pub fn generate_hex_id() -> Result<String, Error> {
    Ok(hex::encode(random_bytes::<32>()?))
}

/// Generate a 256-bit random token encoded as URL-safe base64 (43 characters).
pub fn generate_secure_token() -> Result<String, Error> {
    Ok(BASE64_URL_SAFE_NO_PAD.encode(random_bytes::<32>()?))
}

/// Whether a string has the shape of a token from [`generate_secure_token`].
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == SECURE_TOKEN_LENGTH
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Hex-encoded SHA256 of a token, used as its storage key.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a token against a stored hash in constant time.
pub fn verify_token_hash(token: &str, stored_hash: &str) -> bool {
    constant_time_compare(hash_token(token).as_bytes(), stored_hash.as_bytes())
}

pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
