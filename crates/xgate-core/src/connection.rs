//! The transport-agnostic connection abstraction.
//!
//! A [`Connection`] is one logical bidirectional byte stream to one peer.
//! The transport underneath may be a plain TCP socket, a TLS-wrapped socket,
//! a WebSocket (plain or TLS), or an HTTP/3 stream multiplexed over QUIC —
//! the consumer never needs to know which.  The transport detector in
//! `xgate-net` creates the right implementation once the real protocol of an
//! accepted socket is known; the authentication engine and the session layer
//! only ever see this trait.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// The declared transport tag of a connection.
///
/// The `Display` form is the exact wire/URI tag (`tcp`, `ssl`, `ws`, `wss`,
/// `quic`) and must not change: it appears in connection URIs, log output,
/// and info snapshots consumed by external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Raw application protocol over TCP.
    Tcp,
    /// Raw application protocol over TLS.
    Ssl,
    /// WebSocket over TCP.
    Ws,
    /// WebSocket over TLS.
    Wss,
    /// WebSocket tunneled inside an HTTP/3 stream over QUIC.
    Quic,
}

impl SocketType {
    /// Returns the lowercase tag used in URIs and info snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::Tcp => "tcp",
            SocketType::Ssl => "ssl",
            SocketType::Ws => "ws",
            SocketType::Wss => "wss",
            SocketType::Quic => "quic",
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SocketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(SocketType::Tcp),
            "ssl" => Ok(SocketType::Ssl),
            "ws" => Ok(SocketType::Ws),
            "wss" => Ok(SocketType::Wss),
            "quic" => Ok(SocketType::Quic),
            other => Err(format!("unknown socket type: {other}")),
        }
    }
}

/// The remote endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Errors a [`Connection`] can surface.
///
/// This is a closed taxonomy: every transport maps its own failure modes
/// onto one of these variants so that callers can match on the kind rather
/// than on transport-specific error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was closed; reads and writes after `close()` fail
    /// with this rather than silently succeeding.
    #[error("connection closed")]
    Closed,

    /// An I/O error on the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded operation exceeded the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The peer violated the transport protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer's HTTP/3 WebSocket upgrade response did not include the
    /// required subprotocol; the stream never opened.
    #[error("unsupported websocket subprotocol")]
    UnsupportedSubprotocol,
}

/// Point-in-time diagnostic snapshot of a connection.
///
/// Produced by [`Connection::info`]; reading it never blocks and never
/// mutates connection state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    /// Stable per-connection identifier, assigned at creation.
    pub id: Uuid,
    /// The declared transport tag.
    pub socket_type: String,
    /// Remote endpoint as `host:port`.
    pub endpoint: String,
    /// Total bytes delivered to the caller by `read`.
    pub bytes_read: u64,
    /// Total bytes accepted from the caller by `write`.
    pub bytes_written: u64,
    /// Whether `close()` has run.
    pub closed: bool,
    /// Transport-specific metadata (stream ids, negotiated ALPN, ...).
    pub extra: BTreeMap<String, String>,
}

impl ConnectionInfo {
    /// Creates a snapshot with empty counters for a freshly opened connection.
    pub fn new(socket_type: SocketType, endpoint: &Endpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            socket_type: socket_type.to_string(),
            endpoint: endpoint.to_string(),
            bytes_read: 0,
            bytes_written: 0,
            closed: false,
            extra: BTreeMap::new(),
        }
    }
}

/// One logical duplex byte stream to one peer.
///
/// # Contract
///
/// - `write` enqueues/sends the whole buffer and returns the number of bytes
///   accepted; it never partially corrupts the stream.
/// - `read` waits until at least one byte is available or the stream is
///   closed by the peer, in which case it returns an empty buffer (EOF).
/// - `close` is idempotent and releases the underlying transport resource;
///   once closed, `read`/`write` fail with [`ConnectionError::Closed`].
///   The closed flag is monotonic: it never flips back.
/// - `info` is a non-blocking snapshot and never mutates state.
///
/// A `Connection` is owned exclusively by the execution context handling it
/// and is never mutated concurrently from two contexts.
#[async_trait]
pub trait Connection: Send {
    /// The remote endpoint this connection talks to.
    fn endpoint(&self) -> &Endpoint;

    /// The declared transport tag.
    fn socket_type(&self) -> SocketType;

    /// Reads up to `max` bytes.  An empty result means EOF.
    async fn read(&mut self, max: usize) -> Result<Bytes, ConnectionError>;

    /// Writes the buffer, returning the number of bytes accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError>;

    /// Closes the connection.  Safe to call more than once.
    async fn close(&mut self);

    /// Whether `close()` has run (or the peer closed the stream).
    fn is_closed(&self) -> bool;

    /// Point-in-time diagnostic snapshot.
    fn info(&self) -> ConnectionInfo;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
