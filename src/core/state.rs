//! State Parameter
//!
//! CSRF nonce generation and validation for the consent redirect.

use base64::Engine;
use rand::Rng;

use crate::error::{AuthorizationError, CredentialError};

/// Generate an unpredictable nonce (256 bits, URL-safe base64).
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Check the redirect's `state` against the nonce of this attempt.
///
/// A missing or different value fails with a CSRF mismatch.
pub fn validate_state(expected: &str, received: Option<&str>) -> Result<(), CredentialError> {
    match received {
        Some(received) if constant_time_eq(expected.as_bytes(), received.as_bytes()) => Ok(()),
        _ => Err(CredentialError::Authorization(
            AuthorizationError::StateMismatch {
                received: received.map(String::from),
            },
        )),
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
