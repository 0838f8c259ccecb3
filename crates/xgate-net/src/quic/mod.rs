//! WebSocket-over-HTTP/3 multiplexing on QUIC.
//!
//! One QUIC connection carries many logical connections, each an HTTP/3
//! request stream upgraded with extended CONNECT (RFC 9220,
//! `:protocol = websocket`).  The negotiated ALPN splits the world in two:
//! `h3` runs the multiplexer, the bare session ALPN maps each bidirectional
//! stream directly to one connection with no HTTP framing at all.
//!
//! There is no hidden global event loop: all QUIC activity happens on a
//! [`QuicDriver`] the caller creates, owns, and shuts down.

pub mod client;
pub mod connection;
pub mod h3;
pub mod server;

pub use client::QuicClientMux;
pub use connection::{QuicWsConnection, StreamState};
pub use server::QuicListener;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::tls::{self, TlsConfig};

/// The WebSocket subprotocol both ends must agree on.
pub const SUBPROTOCOL: &str = "xpra";

/// ALPN for the HTTP/3 multiplexer.
pub const ALPN_H3: &[u8] = b"h3";

/// ALPN for raw per-stream tunneling, no HTTP/3 framing.
pub const ALPN_RAW: &[u8] = b"xpra";

/// Sent with every upgrade request.
pub const USER_AGENT: &str = concat!("xgate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum QuicError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] tls::TlsError),

    #[error(transparent)]
    H3(#[from] h3::H3Error),

    #[error("cannot start connecting: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection lost: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("stream write failed: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("quic crypto setup failed: {0}")]
    Crypto(String),

    #[error("quic operation timed out")]
    Timeout,
}

/// Owns one `quinn::Endpoint` and its lifecycle.
///
/// Client muxes and server listeners borrow the driver; dropping or closing
/// it tears down every connection it carries.
pub struct QuicDriver {
    endpoint: quinn::Endpoint,
}

impl QuicDriver {
    /// Creates a client-side driver bound to an ephemeral UDP port.
    pub fn client() -> Result<Self, QuicError> {
        tls::ensure_crypto_provider();
        let bind: SocketAddr = "0.0.0.0:0"
            .parse()
            .map_err(|e| QuicError::Crypto(format!("bad bind address: {e}")))?;
        let endpoint = quinn::Endpoint::client(bind)?;
        Ok(Self { endpoint })
    }

    /// Creates a server-side driver listening on `addr`, offering both the
    /// multiplexer ALPN and the raw session ALPN.
    pub fn server(addr: SocketAddr, tls_config: &TlsConfig) -> Result<Self, QuicError> {
        let crypto = tls::build_server_config(tls_config, &[ALPN_H3, ALPN_RAW])?;
        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| QuicError::Crypto(e.to_string()))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        let endpoint = quinn::Endpoint::server(server_config, addr)?;
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, QuicError> {
        Ok(self.endpoint.local_addr()?)
    }

    pub(crate) fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }

    /// Closes every connection on this driver and stops accepting.
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

/// Opens this endpoint's control and QPACK unidirectional streams and
/// announces `settings`.
pub(crate) async fn send_control_streams(
    connection: &quinn::Connection,
    settings: &[(u64, u64)],
) -> Result<(), QuicError> {
    let mut control = connection.open_uni().await?;
    let mut preface = Vec::new();
    h3::encode_varint(h3::STREAM_CONTROL, &mut preface);
    preface.extend_from_slice(&h3::encode_settings(settings));
    control.write_all(&preface).await?;

    for stream_type in [h3::STREAM_QPACK_ENCODER, h3::STREAM_QPACK_DECODER] {
        let mut stream = connection.open_uni().await?;
        let mut preface = Vec::new();
        h3::encode_varint(stream_type, &mut preface);
        stream.write_all(&preface).await?;
    }
    Ok(())
}

/// Accepts and drains the peer's unidirectional streams (control, QPACK).
/// Their contents are irrelevant to a dynamic-table-free endpoint, but they
/// must be read so flow control keeps moving.
pub(crate) async fn drain_uni_streams(connection: quinn::Connection) {
    loop {
        match connection.accept_uni().await {
            Ok(mut recv) => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    loop {
                        match recv.read(&mut buf).await {
                            Ok(Some(_)) => continue,
                            Ok(None) | Err(_) => return,
                        }
                    }
                });
            }
            Err(e) => {
                debug!("no more unidirectional streams: {e}");
                return;
            }
        }
    }
}

/// The settings a dynamic-table-free endpoint announces.
pub(crate) fn base_settings() -> Vec<(u64, u64)> {
    vec![
        (h3::SETTING_QPACK_MAX_TABLE_CAPACITY, 0),
        (h3::SETTING_QPACK_BLOCKED_STREAMS, 0),
    ]
}
