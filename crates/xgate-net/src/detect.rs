//! Transport detection and in-place upgrade.
//!
//! Every TCP listener accepts the same way: peek at the first bytes of the
//! socket without consuming them, classify, and upgrade in place:
//!
//! - a TLS ClientHello (content type `0x16`, major version 3) starts a TLS
//!   handshake, then detection runs once more on the plaintext to catch a
//!   WebSocket upgrade inside the session;
//! - an HTTP `GET` starts a WebSocket upgrade;
//! - anything else is the raw session protocol.
//!
//! TLS and HTTP clients put bytes on the wire as soon as they connect, but
//! the raw session protocol is server-speaks-first: a raw client sits
//! silent until it receives the challenge.  Silence through the sniff
//! window is therefore itself the classification, not an error.
//!
//! Inside TLS the bytes can no longer be peeked, only read; whatever the
//! classifier consumes there is replayed through
//! [`PrefixedStream`](crate::stream::PrefixedStream).

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use xgate_core::{Connection, Endpoint, SocketType};

use crate::stream::{PrefixedStream, StreamConnection};
use crate::websocket::WsConnection;

/// Bytes needed to classify a socket: enough for the TLS record header and
/// for `"GET "`.
const SNIFF_LEN: usize = 4;

/// How long to wait for a peer's first bytes before classifying it as the
/// raw (server-speaks-first) protocol.
const SNIFF_DEADLINE: Duration = Duration::from_millis(500);

/// How a socket's first bytes classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// TLS record layer: handshake, then detect again inside.
    Tls,
    /// An HTTP request line: WebSocket upgrade.
    HttpUpgrade,
    /// Neither: the raw session protocol.
    Raw,
}

/// Classifies the first bytes of a socket.
pub fn sniff(prefix: &[u8]) -> Sniff {
    // TLS record header: content type 0x16 (handshake), version major 3.
    // The minor version of the ClientHello record ranges from SSLv3 (0)
    // through the TLS 1.3 compatibility value (4).
    if prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && prefix[2] <= 0x04 {
        return Sniff::Tls;
    }
    if prefix.starts_with(b"GET ") {
        return Sniff::HttpUpgrade;
    }
    Sniff::Raw
}

/// Errors raised while detecting and upgrading an accepted socket.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("detection timed out")]
    Timeout,

    #[error("peer sent TLS bytes but no TLS certificate is configured")]
    TlsNotConfigured,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(std::io::Error),

    #[error("websocket upgrade failed: {0}")]
    WsUpgrade(String),

    #[error("peer closed the socket before sending any bytes")]
    EmptySocket,
}

/// Detects the transport of a freshly accepted socket and upgrades it in
/// place, producing the [`Connection`] for its confirmed type.
///
/// The whole process, including any TLS and WebSocket handshakes, is bounded
/// by `timeout`.
pub async fn accept_connection(
    stream: TcpStream,
    endpoint: Endpoint,
    tls: Option<&TlsAcceptor>,
    timeout: Duration,
) -> Result<Box<dyn Connection>, AcceptError> {
    match tokio::time::timeout(timeout, detect_and_upgrade(stream, endpoint, tls)).await {
        Ok(result) => result,
        Err(_) => Err(AcceptError::Timeout),
    }
}

async fn detect_and_upgrade(
    stream: TcpStream,
    endpoint: Endpoint,
    tls: Option<&TlsAcceptor>,
) -> Result<Box<dyn Connection>, AcceptError> {
    let prefix = match peek_prefix(&stream).await? {
        Some(prefix) if prefix.is_empty() => return Err(AcceptError::EmptySocket),
        Some(prefix) => prefix,
        None => {
            debug!(peer = %endpoint, "peer silent past the sniff window, raw tcp");
            return Ok(Box::new(StreamConnection::new(
                stream,
                SocketType::Tcp,
                endpoint,
            )));
        }
    };
    match sniff(&prefix) {
        Sniff::Raw => {
            debug!(peer = %endpoint, "raw tcp connection");
            Ok(Box::new(StreamConnection::new(
                stream,
                SocketType::Tcp,
                endpoint,
            )))
        }
        Sniff::HttpUpgrade => {
            debug!(peer = %endpoint, "http bytes, upgrading to websocket");
            upgrade_websocket(stream, SocketType::Ws, endpoint).await
        }
        Sniff::Tls => {
            let Some(acceptor) = tls else {
                warn!(peer = %endpoint, "TLS bytes on a socket without TLS configured");
                return Err(AcceptError::TlsNotConfigured);
            };
            debug!(peer = %endpoint, "TLS bytes, starting handshake");
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(AcceptError::TlsHandshake)?;
            detect_inside_tls(tls_stream, endpoint).await
        }
    }
}

/// Detection round two, on the plaintext inside an established TLS session.
///
/// Peeking is impossible here: the classified bytes are consumed from the
/// session and replayed via [`PrefixedStream`].  Nested TLS is not a
/// supported transport, so anything that is not an HTTP upgrade is the raw
/// session protocol over `ssl` — including a peer that stays silent, since
/// raw clients wait for the challenge.
async fn detect_inside_tls<S>(
    mut tls_stream: S,
    endpoint: Endpoint,
) -> Result<Box<dyn Connection>, AcceptError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let deadline = tokio::time::Instant::now() + SNIFF_DEADLINE;
    let mut buf = Vec::with_capacity(SNIFF_LEN);
    let mut chunk = [0u8; SNIFF_LEN];
    while buf.len() < SNIFF_LEN {
        let want = SNIFF_LEN - buf.len();
        match tokio::time::timeout_at(deadline, tls_stream.read(&mut chunk[..want])).await {
            Ok(read) => match read? {
                0 => break,
                n => buf.extend_from_slice(&chunk[..n]),
            },
            Err(_) => break,
        }
    }
    let replayed = PrefixedStream::new(buf.clone(), tls_stream);
    match sniff(&buf) {
        Sniff::HttpUpgrade => {
            debug!(peer = %endpoint, "http bytes inside TLS, upgrading to wss");
            upgrade_websocket(replayed, SocketType::Wss, endpoint).await
        }
        _ => {
            debug!(peer = %endpoint, "raw ssl connection");
            Ok(Box::new(StreamConnection::new(
                replayed,
                SocketType::Ssl,
                endpoint,
            )))
        }
    }
}

async fn upgrade_websocket<S>(
    stream: S,
    socket_type: SocketType,
    endpoint: Endpoint,
) -> Result<Box<dyn Connection>, AcceptError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| AcceptError::WsUpgrade(e.to_string()))?;
    Ok(Box::new(WsConnection::new(ws, socket_type, endpoint)))
}

/// Peeks the first bytes of the socket without consuming them.
///
/// A single `peek` can race ahead of the peer's first segment; retry briefly
/// until enough bytes are visible to classify.  `None` means the peer sent
/// nothing through the sniff window: a raw client waiting for the challenge.
async fn peek_prefix(stream: &TcpStream) -> Result<Option<Vec<u8>>, AcceptError> {
    let deadline = tokio::time::Instant::now() + SNIFF_DEADLINE;
    let mut buf = [0u8; SNIFF_LEN];
    let mut n = 0;
    loop {
        match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(peeked) => {
                n = peeked?;
                if n >= SNIFF_LEN || n == 0 {
                    return Ok(Some(buf[..n].to_vec()));
                }
                // Partial first segment; the rest is close behind.
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(_) if n == 0 => return Ok(None),
            Err(_) => return Ok(Some(buf[..n].to_vec())),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_tls_client_hello() {
        assert_eq!(sniff(&[0x16, 0x03, 0x01, 0x02]), Sniff::Tls);
        assert_eq!(sniff(&[0x16, 0x03, 0x03, 0x00]), Sniff::Tls);
        assert_eq!(sniff(&[0x16, 0x03, 0x04]), Sniff::Tls);
    }

    #[test]
    fn test_sniff_rejects_non_tls_record() {
        // Wrong content type.
        assert_eq!(sniff(&[0x17, 0x03, 0x01, 0x00]), Sniff::Raw);
        // Wrong major version.
        assert_eq!(sniff(&[0x16, 0x02, 0x01, 0x00]), Sniff::Raw);
        // Implausible minor version.
        assert_eq!(sniff(&[0x16, 0x03, 0x05, 0x00]), Sniff::Raw);
    }

    #[test]
    fn test_sniff_http_get() {
        assert_eq!(sniff(b"GET / HTTP/1.1\r\n"), Sniff::HttpUpgrade);
        assert_eq!(sniff(b"GET "), Sniff::HttpUpgrade);
        // Not enough to be sure.
        assert_eq!(sniff(b"GET"), Sniff::Raw);
        assert_eq!(sniff(b"POST /"), Sniff::Raw);
    }

    #[test]
    fn test_sniff_raw_bytes() {
        assert_eq!(sniff(b"hello"), Sniff::Raw);
        assert_eq!(sniff(&[]), Sniff::Raw);
        assert_eq!(sniff(&[0x00, 0x01]), Sniff::Raw);
    }

    async fn accepted_pair() -> (TcpStream, TcpStream, Endpoint) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, Endpoint::new(peer.ip().to_string(), peer.port()))
    }

    #[tokio::test]
    async fn test_silent_peer_classifies_as_raw_tcp() {
        // A raw client sends nothing until it sees the challenge; detection
        // must settle on tcp instead of waiting for bytes that never come.
        let (_client, server, endpoint) = accepted_pair().await;
        let conn = accept_connection(server, endpoint, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.socket_type(), SocketType::Tcp);
    }

    #[tokio::test]
    async fn test_prompt_raw_bytes_classify_as_tcp_and_survive() {
        let (mut client, server, endpoint) = accepted_pair().await;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"hello").await.unwrap();
        let mut conn = accept_connection(server, endpoint, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.socket_type(), SocketType::Tcp);
        // Peeked bytes were not consumed.
        assert_eq!(&conn.read(16).await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_peer_closing_without_bytes_is_an_empty_socket() {
        let (client, server, endpoint) = accepted_pair().await;
        drop(client);
        let result = accept_connection(server, endpoint, None, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AcceptError::EmptySocket)));
    }
}
