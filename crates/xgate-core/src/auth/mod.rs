//! Challenge-response authentication engine.
//!
//! After the transport detector has produced a confirmed connection, the
//! server runs one authentication attempt against the configured backend:
//!
//! 1. The backend (unless it is `fail`, which refuses before any challenge)
//!    issues a [`Challenge`]: a fresh random salt plus a declared digest
//!    mechanism.
//! 2. The peer optionally answers with a digest computed from its secret and
//!    the salt.  Supplying no secret means no response.
//! 3. The backend verifies and produces exactly one [`VerificationResult`],
//!    which maps 1:1 to an external result code.  Outcomes are never
//!    silently retried.
//!
//! Backends are a closed set ([`AuthBackend`]): new ones are added by
//! extending the enum, never by runtime discovery.

mod backend;
mod digest;
mod file;
mod selector;

pub use backend::AuthBackend;
pub use digest::DigestMode;
pub use file::{FileAuth, MultiFileAuth, MultiFileRecord};
pub use selector::{parse_backend, parse_challenge_handler, ChallengeHandler};

use rand::RngCore;
use thiserror::Error;

/// Number of random salt bytes issued with every challenge.
pub const SALT_LEN: usize = 32;

/// The closed set of verification outcomes, produced once per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResult {
    /// The attempt is accepted.
    Ok,
    /// A credential was required but absent, or the backend never accepts.
    PasswordRequired,
    /// A credential was supplied but it was wrong.
    AuthenticationFailed,
    /// A credential was supplied to a backend that performs no check.
    NoAuthenticationConfigured,
}

/// Per-attempt challenge value.
///
/// A challenge is bound to exactly one connection attempt: the salt is
/// generated fresh every time, never reused, and the whole value is
/// discarded once the attempt completes or fails.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Opaque random bytes, fresh for this attempt.
    pub salt: Vec<u8>,
    /// The digest mechanism the response must use.
    pub digest: DigestMode,
}

impl Challenge {
    /// Generates a new challenge with a fresh random salt.
    pub fn new(digest: DigestMode) -> Self {
        let mut salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self { salt, digest }
    }
}

/// The peer's answer to a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    /// Hex-encoded digest over the secret and the challenge salt.
    pub digest_hex: String,
    /// The claimed username, required by the `multifile` backend.
    pub username: Option<String>,
}

impl AuthResponse {
    pub fn new(digest_hex: impl Into<String>, username: Option<String>) -> Self {
        Self {
            digest_hex: digest_hex.into(),
            username,
        }
    }
}

/// Errors raised while configuring the authentication engine.
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    /// The selector named a backend that does not exist.
    #[error("unknown authentication backend: {0}")]
    UnknownBackend(String),

    /// The selector named a challenge handler that does not exist.
    #[error("unknown challenge handler: {0}")]
    UnknownHandler(String),

    /// A selector option was not of the form `key=value`.
    #[error("malformed selector option: {0:?}")]
    MalformedOption(String),

    /// A handler that needs an option was configured without it.
    #[error("{handler} handler requires the {option:?} option")]
    MissingOption {
        handler: &'static str,
        option: &'static str,
    },

    /// The declared digest mechanism is not recognized.
    #[error("unknown digest mechanism: {0}")]
    UnknownDigest(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_salt_has_expected_length() {
        let c = Challenge::new(DigestMode::default());
        assert_eq!(c.salt.len(), SALT_LEN);
    }

    #[test]
    fn test_challenge_salts_are_never_reused() {
        // Two consecutive attempts must get different salts.
        let a = Challenge::new(DigestMode::default());
        let b = Challenge::new(DigestMode::default());
        assert_ne!(a.salt, b.salt);
    }
}
