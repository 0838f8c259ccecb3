//! Server side of the QUIC multiplexer.
//!
//! Accepts QUIC connections and demultiplexes on the negotiated ALPN:
//! `h3` connections run the extended-CONNECT upgrade per request stream,
//! the raw session ALPN maps each bidirectional stream straight to a
//! connection.  Every stream that survives its upgrade goes through the
//! same authentication handshake as a TCP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::join;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use xgate_core::{Connection, ConnectionError, Endpoint, SocketType};

use crate::config::ServerConfig;
use crate::listener::authenticate_and_admit;
use crate::stream::StreamConnection;
use crate::tls::TlsConfig;

use super::connection::{
    header_value, pump_stream, subprotocol_accepted, QuicWsConnection, StreamMap, StreamState,
    WriteHalf,
};
use super::h3::{self, Frame, FrameReader, FRAME_HEADERS};
use super::{
    base_settings, drain_uni_streams, send_control_streams, QuicDriver, QuicError, ALPN_H3,
    ALPN_RAW, SUBPROTOCOL, USER_AGENT,
};

/// Queued events per stream before the pump backpressures.
const STREAM_EVENT_QUEUE: usize = 64;

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// One QUIC listening socket.
pub struct QuicListener {
    driver: QuicDriver,
}

impl QuicListener {
    pub fn bind(addr: SocketAddr, tls_config: &TlsConfig) -> Result<Self, QuicError> {
        Ok(Self {
            driver: QuicDriver::server(addr, tls_config)?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, QuicError> {
        self.driver.local_addr()
    }

    /// Accepts connections until `running` clears, handing every admitted
    /// connection to `admitted`.
    pub async fn run(
        self,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
        admitted: mpsc::Sender<Box<dyn Connection>>,
    ) {
        info!(addr = ?self.driver.local_addr(), "quic listener up");
        while running.load(Ordering::Relaxed) {
            match tokio::time::timeout(ACCEPT_POLL, self.driver.endpoint().accept()).await {
                Ok(Some(incoming)) => {
                    tokio::spawn(handle_quic_connection(
                        incoming,
                        config.clone(),
                        admitted.clone(),
                    ));
                }
                // The endpoint was closed underneath us.
                Ok(None) => break,
                // Poll tick: re-check the flag.
                Err(_) => continue,
            }
        }
        self.driver.shutdown();
        info!("quic listener down");
    }
}

async fn handle_quic_connection(
    incoming: quinn::Incoming,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    let remote = incoming.remote_address();
    if let Err(e) = run_quic_connection(incoming, config, admitted).await {
        debug!(peer = %remote, "quic connection ended: {e:#}");
    }
}

async fn run_quic_connection(
    incoming: quinn::Incoming,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) -> anyhow::Result<()> {
    let connection = incoming.await.context("quic handshake")?;
    let remote = connection.remote_address();
    let endpoint = Endpoint::new(remote.ip().to_string(), remote.port());
    let alpn = negotiated_alpn(&connection);
    debug!(peer = %endpoint, alpn = %String::from_utf8_lossy(&alpn), "quic connection up");

    if alpn == ALPN_RAW {
        run_raw_connection(connection, endpoint, config, admitted).await
    } else if alpn == ALPN_H3 {
        run_h3_connection(connection, endpoint, config, admitted).await
    } else {
        warn!(peer = %endpoint, "unknown alpn, closing");
        connection.close(0u32.into(), b"unsupported alpn");
        Ok(())
    }
}

fn negotiated_alpn(connection: &quinn::Connection) -> Vec<u8> {
    connection
        .handshake_data()
        .and_then(|data| {
            data.downcast::<quinn::crypto::rustls::HandshakeData>()
                .ok()
        })
        .and_then(|data| data.protocol)
        .unwrap_or_default()
}

/// Raw ALPN: every bidirectional stream is one connection, no framing.
///
/// Streams open lazily, so the peer announces each one with a single
/// subprotocol line; the handshake proper starts after that.
async fn run_raw_connection(
    connection: quinn::Connection,
    endpoint: Endpoint,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) -> anyhow::Result<()> {
    loop {
        let (send, recv) = connection.accept_bi().await.context("accept stream")?;
        let conn = StreamConnection::new(join(recv, send), SocketType::Quic, endpoint.clone());
        tokio::spawn(admit_raw_stream(
            Box::new(conn) as Box<dyn Connection>,
            config.clone(),
            admitted.clone(),
        ));
    }
}

async fn admit_raw_stream(
    mut conn: Box<dyn Connection>,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    match read_preamble(&mut *conn, config.timeout).await {
        Ok(name) if name == SUBPROTOCOL => {
            authenticate_and_admit(conn, config, admitted).await;
        }
        Ok(name) => {
            warn!(peer = %conn.endpoint(), subprotocol = %name, "unsupported subprotocol on raw stream");
            conn.close().await;
        }
        Err(e) => {
            debug!(peer = %conn.endpoint(), "raw stream preamble failed: {e}");
            conn.close().await;
        }
    }
}

/// Longest accepted stream-announcement line.
const MAX_PREAMBLE: usize = 64;

/// Reads the `\n`-terminated subprotocol line that opens a raw stream.
async fn read_preamble(
    conn: &mut dyn Connection,
    timeout: Duration,
) -> Result<String, ConnectionError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut line = Vec::new();
    loop {
        let byte = tokio::time::timeout_at(deadline, conn.read(1))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        if byte.is_empty() || byte[0] == b'\n' {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        line.push(byte[0]);
        if line.len() > MAX_PREAMBLE {
            return Err(ConnectionError::Protocol(
                "stream preamble too long".to_string(),
            ));
        }
    }
}

/// `h3` ALPN: run the HTTP/3 preface, then upgrade request streams.
async fn run_h3_connection(
    connection: quinn::Connection,
    endpoint: Endpoint,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) -> anyhow::Result<()> {
    let mut settings = base_settings();
    settings.push((h3::SETTING_ENABLE_CONNECT_PROTOCOL, 1));
    send_control_streams(&connection, &settings)
        .await
        .context("http/3 preface")?;
    tokio::spawn(drain_uni_streams(connection.clone()));

    let map = StreamMap::new();
    loop {
        let (send, recv) = connection.accept_bi().await.context("accept stream")?;
        tokio::spawn(handle_h3_stream(
            map.clone(),
            send,
            recv,
            endpoint.clone(),
            config.clone(),
            admitted.clone(),
        ));
    }
}

async fn handle_h3_stream(
    map: Arc<StreamMap>,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    endpoint: Endpoint,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    let stream_id = quinn::VarInt::from(send.id()).into_inner();
    if let Err(e) = run_h3_stream(map, send, recv, stream_id, endpoint, config, admitted).await {
        debug!(stream_id, "h3 stream ended: {e}");
    }
}

async fn run_h3_stream(
    map: Arc<StreamMap>,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
    stream_id: u64,
    endpoint: Endpoint,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) -> Result<(), QuicError> {
    let mut reader = FrameReader::new(recv);
    let headers = match reader.next().await? {
        Some(Frame {
            frame_type: FRAME_HEADERS,
            payload,
        }) => h3::decode_headers(&payload)?,
        Some(frame) => {
            return Err(QuicError::H3(h3::H3Error::Malformed(format!(
                "expected HEADERS, got frame type {:#x}",
                frame.frame_type
            ))))
        }
        None => return Ok(()),
    };

    if let Err(reason) = validate_upgrade(&headers) {
        warn!(peer = %endpoint, stream_id, "rejecting upgrade: {reason}");
        let response = h3::encode_headers(&response_headers(400, None));
        h3::write_frame(&mut send, FRAME_HEADERS, &response).await?;
        let _ = send.finish();
        return Ok(());
    }
    debug!(peer = %endpoint, stream_id, "websocket upgrade accepted");

    let response = h3::encode_headers(&response_headers(200, Some(SUBPROTOCOL)));
    h3::write_frame(&mut send, FRAME_HEADERS, &response).await?;

    // Server-side streams are established the moment the 200 is out; no
    // buffering phase.
    let state = Arc::new(AtomicU8::new(StreamState::Open as u8));
    let write = Arc::new(Mutex::new(WriteHalf::new(
        send,
        StreamState::Open,
        state.clone(),
    )));
    let (tx, rx) = mpsc::channel(STREAM_EVENT_QUEUE);
    map.insert(stream_id, tx).await;
    tokio::spawn(pump_stream(map.clone(), stream_id, reader));

    let conn = QuicWsConnection::new(stream_id, endpoint, write, rx, map, state);
    authenticate_and_admit(Box::new(conn) as Box<dyn Connection>, config, admitted).await;
    Ok(())
}

/// Checks the extended-CONNECT contract on a request stream.
fn validate_upgrade(headers: &[(String, String)]) -> Result<(), String> {
    match header_value(headers, ":method") {
        Some("CONNECT") => {}
        other => return Err(format!("method {other:?}, want CONNECT")),
    }
    match header_value(headers, ":protocol") {
        Some("websocket") => {}
        other => return Err(format!("protocol {other:?}, want websocket")),
    }
    match header_value(headers, ":scheme") {
        Some("https") => {}
        other => return Err(format!("scheme {other:?}, want https")),
    }
    if !subprotocol_accepted(headers, SUBPROTOCOL) {
        return Err(format!(
            "subprotocol {:?}, want {SUBPROTOCOL}",
            header_value(headers, "sec-websocket-protocol")
        ));
    }
    Ok(())
}

fn response_headers(status: u16, subprotocol: Option<&str>) -> Vec<(String, String)> {
    let mut headers = vec![(":status".to_string(), status.to_string())];
    if let Some(p) = subprotocol {
        headers.push(("sec-websocket-protocol".to_string(), p.to_string()));
    }
    headers.push(("server".to_string(), USER_AGENT.to_string()));
    headers
}

// ── Tests ─────────────────────────────────────────────────────────────────────
