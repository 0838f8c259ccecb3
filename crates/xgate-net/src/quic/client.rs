//! Client side of the QUIC multiplexer.
//!
//! A [`QuicClientMux`] owns one QUIC connection and opens any number of
//! tunneled connections over it.  Each `open()` sends the extended-CONNECT
//! upgrade and returns immediately: the stream is usable at once, with
//! writes buffered until the server's verdict lands.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::join;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use xgate_core::{Connection, Endpoint, SocketType};

use crate::stream::StreamConnection;
use crate::tls::{self, ClientTlsConfig};

use super::connection::{
    process_response, pump_stream, QuicWsConnection, StreamEvent, StreamMap, StreamState,
    WriteHalf,
};
use super::h3::{self, Frame, FrameReader, FRAME_HEADERS};
use super::{
    base_settings, drain_uni_streams, send_control_streams, QuicDriver, QuicError, ALPN_H3,
    ALPN_RAW, SUBPROTOCOL, USER_AGENT,
};

/// Queued events per stream before the pump backpressures.
const STREAM_EVENT_QUEUE: usize = 64;

/// The header block of an extended-CONNECT WebSocket upgrade.
fn upgrade_request_headers(authority: &str, path: &str) -> Vec<(String, String)> {
    vec![
        (":method".to_string(), "CONNECT".to_string()),
        (":scheme".to_string(), "https".to_string()),
        (":authority".to_string(), authority.to_string()),
        (":path".to_string(), path.to_string()),
        (":protocol".to_string(), "websocket".to_string()),
        ("sec-websocket-version".to_string(), "13".to_string()),
        ("sec-websocket-protocol".to_string(), SUBPROTOCOL.to_string()),
        ("user-agent".to_string(), USER_AGENT.to_string()),
    ]
}

/// One multiplexed QUIC connection to one server.
pub struct QuicClientMux {
    connection: quinn::Connection,
    host: String,
    port: u16,
    map: Arc<StreamMap>,
}

impl QuicClientMux {
    /// Dials `host:port` over the driver, negotiates `h3`, and performs the
    /// HTTP/3 preface (control stream plus settings).
    pub async fn connect(
        driver: &QuicDriver,
        host: &str,
        port: u16,
        tls_config: &ClientTlsConfig,
        timeout: Duration,
    ) -> Result<Self, QuicError> {
        let addr = resolve(host, port).await?;
        let crypto = tls::build_client_config(tls_config, &[ALPN_H3])?;
        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| QuicError::Crypto(e.to_string()))?;
        let config = quinn::ClientConfig::new(Arc::new(quic_crypto));

        let connecting = driver.endpoint().connect_with(config, addr, host)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| QuicError::Timeout)??;

        send_control_streams(&connection, &base_settings()).await?;
        tokio::spawn(drain_uni_streams(connection.clone()));

        Ok(Self {
            connection,
            host: host.to_string(),
            port,
            map: StreamMap::new(),
        })
    }

    /// Opens one tunneled connection.
    ///
    /// Returns as soon as the upgrade request is on the wire; the returned
    /// connection buffers writes until the server accepts and surfaces a
    /// rejection through its first failing read.
    pub async fn open(&self, path: &str) -> Result<QuicWsConnection<quinn::SendStream>, QuicError> {
        let (send, recv) = self.connection.open_bi().await?;
        let stream_id = quinn::VarInt::from(send.id()).into_inner();

        let state = Arc::new(AtomicU8::new(StreamState::Requested as u8));
        let write = Arc::new(Mutex::new(WriteHalf::new(
            send,
            StreamState::Requested,
            state.clone(),
        )));

        let authority = format!("{}:{}", self.host, self.port);
        write
            .lock()
            .await
            .send_headers(&upgrade_request_headers(&authority, path))
            .await
            .map_err(|e| QuicError::H3(h3::H3Error::Stream(e.to_string())))?;
        debug!(stream_id, authority, path, "websocket upgrade requested");

        let (tx, rx) = mpsc::channel(STREAM_EVENT_QUEUE);
        self.map.insert(stream_id, tx).await;
        tokio::spawn(handle_response(
            self.map.clone(),
            stream_id,
            write.clone(),
            recv,
        ));

        Ok(QuicWsConnection::new(
            stream_id,
            Endpoint::new(self.host.clone(), self.port),
            write,
            rx,
            self.map.clone(),
            state,
        ))
    }

    /// Closes the underlying QUIC connection and every stream on it.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"closing");
    }
}

/// Consumes the server's upgrade response, settles the stream's fate, and
/// keeps pumping DATA frames afterwards.
async fn handle_response(
    map: Arc<StreamMap>,
    stream_id: u64,
    write: Arc<Mutex<WriteHalf<quinn::SendStream>>>,
    recv: quinn::RecvStream,
) {
    let mut reader = FrameReader::new(recv);
    match reader.next().await {
        Ok(Some(Frame {
            frame_type: FRAME_HEADERS,
            payload,
        })) => match h3::decode_headers(&payload) {
            Ok(headers) => match process_response(&headers, &write).await {
                Ok(()) => {
                    debug!(stream_id, "upgrade accepted");
                    pump_stream(map, stream_id, reader).await;
                }
                Err(reason) => {
                    debug!(stream_id, ?reason, "upgrade rejected");
                    map.dispatch(stream_id, StreamEvent::Rejected(reason)).await;
                }
            },
            Err(e) => {
                map.dispatch(stream_id, StreamEvent::Error(e.to_string()))
                    .await;
            }
        },
        Ok(Some(frame)) => {
            map.dispatch(
                stream_id,
                StreamEvent::Error(format!(
                    "expected HEADERS, got frame type {:#x}",
                    frame.frame_type
                )),
            )
            .await;
        }
        Ok(None) => {
            map.dispatch(
                stream_id,
                StreamEvent::Error("stream closed before any response".to_string()),
            )
            .await;
        }
        Err(e) => {
            map.dispatch(stream_id, StreamEvent::Error(e.to_string()))
                .await;
        }
    }
}

/// Dials with the raw session ALPN: one bidirectional stream, no HTTP/3.
///
/// Streams open lazily, so the first bytes on the wire are a single line
/// announcing the subprotocol; the server discards it before handshaking.
pub async fn connect_raw(
    driver: &QuicDriver,
    host: &str,
    port: u16,
    tls_config: &ClientTlsConfig,
    timeout: Duration,
) -> Result<Box<dyn Connection>, QuicError> {
    let addr = resolve(host, port).await?;
    let crypto = tls::build_client_config(tls_config, &[ALPN_RAW])?;
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| QuicError::Crypto(e.to_string()))?;
    let config = quinn::ClientConfig::new(Arc::new(quic_crypto));

    let connecting = driver.endpoint().connect_with(config, addr, host)?;
    let connection = tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| QuicError::Timeout)??;
    let (mut send, recv) = connection.open_bi().await?;
    send.write_all(format!("{SUBPROTOCOL}\n").as_bytes()).await?;
    Ok(Box::new(StreamConnection::new(
        join(recv, send),
        SocketType::Quic,
        Endpoint::new(host, port),
    )))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, QuicError> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            QuicError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {host}"),
            ))
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_request_headers_shape() {
        let headers = upgrade_request_headers("server.example:14510", "/session");
        // Pseudo-headers first, per HTTP/3.
        let pseudo_end = headers.iter().position(|(n, _)| !n.starts_with(':')).unwrap();
        assert!(headers[..pseudo_end]
            .iter()
            .all(|(n, _)| n.starts_with(':')));

        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get(":method"), Some("CONNECT"));
        assert_eq!(get(":scheme"), Some("https"));
        assert_eq!(get(":authority"), Some("server.example:14510"));
        assert_eq!(get(":path"), Some("/session"));
        assert_eq!(get(":protocol"), Some("websocket"));
        assert_eq!(get("sec-websocket-version"), Some("13"));
        assert_eq!(get("sec-websocket-protocol"), Some("xpra"));
        assert!(get("user-agent").unwrap().starts_with("xgate/"));
    }
}
