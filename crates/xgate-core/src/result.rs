//! External result codes.
//!
//! Every connection attempt resolves to exactly one of these codes.  The
//! `Display` strings are a stable external contract shared with clients and
//! test harnesses and must match exactly.

use std::fmt;

use crate::auth::VerificationResult;

/// The definitive outcome of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Authentication succeeded, or no authentication was required.
    Ok,
    /// Transport-level failure: refused, reset, timed out, malformed
    /// protocol bytes, or the `fail` backend tearing the socket down.
    ConnectionFailed,
    /// A credential was supplied but it was incorrect.
    AuthenticationFailed,
    /// A credential was required but absent, or the backend never accepts.
    PasswordRequired,
    /// A credential was supplied to a backend that performs no check.
    NoAuthentication,
    /// The TLS handshake completed but the certificate chain failed
    /// verification under the configured verify-mode.
    SslCertificateVerifyFailure,
}

impl ResultCode {
    /// Returns the stable external code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::ConnectionFailed => "CONNECTION_FAILED",
            ResultCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ResultCode::PasswordRequired => "PASSWORD_REQUIRED",
            ResultCode::NoAuthentication => "NO_AUTHENTICATION",
            ResultCode::SslCertificateVerifyFailure => "SSL_CERTIFICATE_VERIFY_FAILURE",
        }
    }

    /// Parses a code string, accepting exactly the `Display` forms.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(ResultCode::Ok),
            "CONNECTION_FAILED" => Some(ResultCode::ConnectionFailed),
            "AUTHENTICATION_FAILED" => Some(ResultCode::AuthenticationFailed),
            "PASSWORD_REQUIRED" => Some(ResultCode::PasswordRequired),
            "NO_AUTHENTICATION" => Some(ResultCode::NoAuthentication),
            "SSL_CERTIFICATE_VERIFY_FAILURE" => Some(ResultCode::SslCertificateVerifyFailure),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exact mapping from a verification outcome to the external code.
impl From<VerificationResult> for ResultCode {
    fn from(v: VerificationResult) -> Self {
        match v {
            VerificationResult::Ok => ResultCode::Ok,
            VerificationResult::PasswordRequired => ResultCode::PasswordRequired,
            VerificationResult::AuthenticationFailed => ResultCode::AuthenticationFailed,
            VerificationResult::NoAuthenticationConfigured => ResultCode::NoAuthentication,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
