//! Outbound connectors for the TCP-based socket types.
//!
//! [`client_connect`] dials a `tcp://`, `ssl://`, `ws://`, or `wss://` URI,
//! runs the client side of the authentication handshake, and resolves the
//! whole attempt to exactly one [`ResultCode`].  Nothing here panics or
//! retries: refused sockets, timeouts, and protocol violations are all
//! `CONNECTION_FAILED`, and a certificate rejected under the configured
//! verify mode is `SSL_CERTIFICATE_VERIFY_FAILURE`.

use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use xgate_core::{ChallengeHandler, Connection, Endpoint, ResultCode, SocketType};

use crate::config::DEFAULT_TIMEOUT;
use crate::handshake;
use crate::stream::StreamConnection;
use crate::tls::{self, ClientTlsConfig};
use crate::uri::TargetUri;
use crate::websocket::WsConnection;

/// Client-side connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub tls: ClientTlsConfig,
    /// Source of the secret used to answer the challenge; without one the
    /// client answers `noresponse`.
    pub handler: Option<ChallengeHandler>,
    /// Username claimed in the response, for `multifile` servers.
    pub username: Option<String>,
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tls: ClientTlsConfig::default(),
            handler: None,
            username: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error("{0}")]
    Uri(#[from] crate::uri::UriError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    Timeout,

    #[error(transparent)]
    Tls(#[from] tls::TlsError),

    #[error("certificate verification failed: {0}")]
    CertificateVerify(std::io::Error),

    #[error("websocket upgrade failed: {0}")]
    WsUpgrade(String),
}

impl ConnectError {
    fn result_code(&self) -> ResultCode {
        match self {
            ConnectError::CertificateVerify(_) => ResultCode::SslCertificateVerifyFailure,
            _ => ResultCode::ConnectionFailed,
        }
    }
}

/// Dials `uri`, authenticates, and resolves to exactly one result code.
///
/// On `OK` the admitted connection is closed politely; callers that want to
/// keep it use [`connect_transport`] and run the handshake themselves.
pub async fn client_connect(uri: &str, opts: &ClientOptions) -> ResultCode {
    let mut conn = match connect_transport(uri, opts).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(uri, "connect failed: {e}");
            return e.result_code();
        }
    };
    let code = handshake::respond(
        &mut *conn,
        opts.handler.as_ref(),
        opts.username.as_deref(),
        opts.timeout,
    )
    .await;
    conn.close().await;
    code
}

/// Establishes the transport named by `uri` without authenticating.
pub async fn connect_transport(
    uri: &str,
    opts: &ClientOptions,
) -> Result<Box<dyn Connection>, ConnectErrorPublic> {
    let target: TargetUri = uri.parse().map_err(ConnectError::Uri)?;
    match tokio::time::timeout(opts.timeout, dial(&target, opts)).await {
        Ok(result) => result.map_err(ConnectErrorPublic),
        Err(_) => Err(ConnectErrorPublic(ConnectError::Timeout)),
    }
}

/// Opaque connect failure that still exposes its result-code mapping.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConnectErrorPublic(ConnectError);

impl ConnectErrorPublic {
    pub fn result_code(&self) -> ResultCode {
        self.0.result_code()
    }
}

impl From<ConnectError> for ConnectErrorPublic {
    fn from(e: ConnectError) -> Self {
        Self(e)
    }
}

async fn dial(
    target: &TargetUri,
    opts: &ClientOptions,
) -> Result<Box<dyn Connection>, ConnectError> {
    let endpoint = Endpoint::new(target.host.clone(), target.port);
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;

    match target.socket_type {
        SocketType::Tcp => Ok(Box::new(StreamConnection::new(
            stream,
            SocketType::Tcp,
            endpoint,
        ))),
        SocketType::Ssl => {
            let tls_stream = tls_handshake(stream, target, opts).await?;
            Ok(Box::new(StreamConnection::new(
                tls_stream,
                SocketType::Ssl,
                endpoint,
            )))
        }
        SocketType::Ws => {
            let request = format!("ws://{}:{}{}", target.host, target.port, target.path);
            let (ws, _response) = tokio_tungstenite::client_async(request, stream)
                .await
                .map_err(|e| ConnectError::WsUpgrade(e.to_string()))?;
            Ok(Box::new(WsConnection::new(ws, SocketType::Ws, endpoint)))
        }
        SocketType::Wss => {
            let tls_stream = tls_handshake(stream, target, opts).await?;
            let request = format!("wss://{}:{}{}", target.host, target.port, target.path);
            let (ws, _response) = tokio_tungstenite::client_async(request, tls_stream)
                .await
                .map_err(|e| ConnectError::WsUpgrade(e.to_string()))?;
            Ok(Box::new(WsConnection::new(ws, SocketType::Wss, endpoint)))
        }
        // Unreachable: TargetUri never parses to quic.
        SocketType::Quic => Err(ConnectError::Uri(crate::uri::UriError::UnsupportedScheme(
            "quic".to_string(),
        ))),
    }
}

async fn tls_handshake(
    stream: TcpStream,
    target: &TargetUri,
    opts: &ClientOptions,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let connector = tls::build_connector(&opts.tls)?;
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| ConnectError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
    connector.connect(server_name, stream).await.map_err(|e| {
        if tls::is_certificate_verify_error(&e) {
            ConnectError::CertificateVerify(e)
        } else {
            ConnectError::Io(e)
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
