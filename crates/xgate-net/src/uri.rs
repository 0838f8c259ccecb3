//! Connection URI parsing.
//!
//! Outbound connections are addressed as `scheme://host:port[/path]` where
//! the scheme is one of the TCP-based socket types: `tcp`, `ssl`, `ws`,
//! `wss`.  QUIC has no URI scheme here; it is reached through the
//! multiplexer in [`crate::quic`], which addresses hosts directly.

use std::str::FromStr;

use thiserror::Error;
use url::Url;

use xgate_core::SocketType;

/// A parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    pub socket_type: SocketType,
    pub host: String,
    pub port: u16,
    /// Request path for the WebSocket upgrade; `/` unless given.
    pub path: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum UriError {
    #[error("cannot parse uri: {0}")]
    Parse(String),

    #[error("unsupported uri scheme: {0:?}")]
    UnsupportedScheme(String),

    #[error("uri has no host")]
    MissingHost,

    #[error("uri has no port")]
    MissingPort,
}

impl FromStr for TargetUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| UriError::Parse(e.to_string()))?;
        let socket_type = match url.scheme() {
            "tcp" => SocketType::Tcp,
            "ssl" => SocketType::Ssl,
            "ws" => SocketType::Ws,
            "wss" => SocketType::Wss,
            other => return Err(UriError::UnsupportedScheme(other.to_string())),
        };
        let host = url.host_str().ok_or(UriError::MissingHost)?.to_string();
        let port = url.port().ok_or(UriError::MissingPort)?;
        let path = match url.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        Ok(TargetUri {
            socket_type,
            host,
            port,
            path,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
