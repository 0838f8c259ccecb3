//! Challenge digest mechanisms.
//!
//! The mechanism identifier travels in the challenge itself, so the peer
//! always knows how to compute its response.  Comparison of the expected and
//! supplied digests runs in constant time relative to the secret length;
//! this is a hard correctness requirement, not an optimization.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// The digest mechanism declared by a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestMode {
    /// HMAC-SHA256 keyed by the secret over the salt.
    #[default]
    HmacSha256,
    /// Plain SHA-256 over `secret ‖ salt`.
    Sha256,
}

impl DigestMode {
    /// The wire identifier sent in the challenge line.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestMode::HmacSha256 => "hmac-sha256",
            DigestMode::Sha256 => "sha256",
        }
    }

    /// Computes the response digest for `secret` under this mechanism.
    pub fn respond(&self, secret: &[u8], salt: &[u8]) -> Vec<u8> {
        match self {
            DigestMode::HmacSha256 => {
                // HMAC accepts keys of any length, so this cannot fail for
                // SHA-256; an empty digest never verifies.
                let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
                    return Vec::new();
                };
                mac.update(salt);
                mac.finalize().into_bytes().to_vec()
            }
            DigestMode::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(secret);
                hasher.update(salt);
                hasher.finalize().to_vec()
            }
        }
    }

    /// Verifies a hex-encoded response against the stored secret.
    ///
    /// The comparison of digest bytes is constant time.  Returns `false` for
    /// malformed hex or a length mismatch.
    pub fn verify(&self, secret: &[u8], salt: &[u8], response_hex: &str) -> bool {
        let expected = self.respond(secret, salt);
        let provided = match hex::decode(response_hex) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        // ct_eq on slices resolves to "not equal" without leaking contents
        // when the lengths differ.
        expected.ct_eq(&provided).into()
    }
}

impl fmt::Display for DigestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestMode {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hmac-sha256" => Ok(DigestMode::HmacSha256),
            "sha256" => Ok(DigestMode::Sha256),
            other => Err(AuthError::UnknownDigest(other.to_string())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
