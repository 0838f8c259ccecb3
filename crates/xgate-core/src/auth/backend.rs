//! The verifier backends.
//!
//! [`AuthBackend`] is a closed tagged-variant registry: each variant carries
//! its own configuration payload and verification is dispatched through a
//! single `match`.  Adding a backend means extending the enum; there is no
//! runtime discovery.

use super::file::{FileAuth, MultiFileAuth};
use super::{AuthResponse, Challenge, VerificationResult};

/// A named, configured verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthBackend {
    /// No authentication: any supplied credential is invalid input.
    None,
    /// Accepts any credential, but one must be supplied.
    Allow,
    /// Issues a challenge but never accepts.
    Reject,
    /// Refuses before any challenge is issued; the peer observes a
    /// connection failure rather than an authentication rejection.
    Fail,
    /// Compares against a single shared secret stored in a file.
    File(FileAuth),
    /// Compares against a username-indexed credential table.
    MultiFile(MultiFileAuth),
}

impl AuthBackend {
    /// The selector name of this backend.
    pub fn name(&self) -> &'static str {
        match self {
            AuthBackend::None => "none",
            AuthBackend::Allow => "allow",
            AuthBackend::Reject => "reject",
            AuthBackend::Fail => "fail",
            AuthBackend::File(_) => "file",
            AuthBackend::MultiFile(_) => "multifile",
        }
    }

    /// Whether this backend sends a challenge at all.
    ///
    /// Every backend except `fail` sends one — even the ones that do not use
    /// the response (`none`, `allow`) — so the absence or presence of a
    /// credential is observable.  `fail` tears the connection down first.
    pub fn issues_challenge(&self) -> bool {
        !matches!(self, AuthBackend::Fail)
    }

    /// Verifies one response against this backend's configuration.
    ///
    /// `display` is the display the connection is aimed at; only the
    /// `multifile` backend consults it.  Produces exactly one outcome per
    /// attempt; the caller maps it to the external result code and never
    /// retries silently.
    pub fn verify(
        &self,
        challenge: &Challenge,
        response: Option<&AuthResponse>,
        display: &str,
    ) -> VerificationResult {
        match self {
            // A response supplied to a backend that performs no check is
            // invalid input, not a silent success.
            AuthBackend::None => match response {
                Some(_) => VerificationResult::NoAuthenticationConfigured,
                None => VerificationResult::Ok,
            },

            AuthBackend::Allow => match response {
                Some(_) => VerificationResult::Ok,
                None => VerificationResult::PasswordRequired,
            },

            AuthBackend::Reject => VerificationResult::PasswordRequired,

            // `fail` never reaches verification; if it somehow does, it
            // still never accepts.
            AuthBackend::Fail => VerificationResult::PasswordRequired,

            AuthBackend::File(file) => {
                let Some(response) = response else {
                    return VerificationResult::PasswordRequired;
                };
                let Some(secret) = file.load_secret() else {
                    // Missing or unconfigured credential file: no credential
                    // can ever match.
                    return VerificationResult::PasswordRequired;
                };
                verify_digest(challenge, secret.as_bytes(), &response.digest_hex)
            }

            AuthBackend::MultiFile(table) => {
                let Some(response) = response else {
                    return VerificationResult::PasswordRequired;
                };
                let Some(username) = response.username.as_deref() else {
                    return VerificationResult::PasswordRequired;
                };
                let Some(record) = table.lookup(username) else {
                    return VerificationResult::PasswordRequired;
                };
                if !record.allows_display(display) {
                    return VerificationResult::PasswordRequired;
                }
                verify_digest(challenge, record.password.as_bytes(), &response.digest_hex)
            }
        }
    }
}

/// Shared digest comparison for the credential-backed backends.
fn verify_digest(
    challenge: &Challenge,
    secret: &[u8],
    response_hex: &str,
) -> VerificationResult {
    if challenge.digest.verify(secret, &challenge.salt, response_hex) {
        VerificationResult::Ok
    } else {
        VerificationResult::AuthenticationFailed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
