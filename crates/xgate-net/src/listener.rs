//! Listening sockets and the admission pipeline.
//!
//! [`Server`] binds every configured listener, then [`Server::run`] accepts
//! until the shared running flag clears.  Each accepted socket is handled on
//! its own task: transport detection, the authentication handshake, and —
//! for connections that resolve to `OK` — hand-off to the session layer
//! through an mpsc channel.  Every other outcome closes the socket here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use xgate_core::{Connection, Endpoint, ResultCode};

use crate::config::ServerConfig;
use crate::detect::accept_connection;
use crate::handshake;
use crate::quic::QuicListener;
use crate::tls::build_acceptor;

/// How often accept loops re-check the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Backlog of admitted connections awaiting the session layer.
const ADMITTED_QUEUE: usize = 64;

/// A fully bound server, not yet accepting.
///
/// Binding is separate from running so callers (and tests) can bind port
/// zero and learn the actual addresses before any socket is accepted.
pub struct Server {
    config: Arc<ServerConfig>,
    tcp: Vec<(TcpListener, &'static str)>,
    quic: Vec<QuicListener>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Binds every configured listener.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let tls = match &config.tls {
            Some(tls_config) => Some(build_acceptor(tls_config).context("TLS setup")?),
            None => None,
        };

        let mut tcp = Vec::new();
        for (addr, label) in config.tcp_binds() {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("cannot bind {label} listener on {addr}"))?;
            info!(%addr, label, "listening");
            tcp.push((listener, label));
        }

        let mut quic = Vec::new();
        for addr in &config.bind_quic {
            let tls_config = config
                .tls
                .as_ref()
                .context("quic listeners need ssl_cert and ssl_key")?;
            let listener = QuicListener::bind(*addr, tls_config)
                .with_context(|| format!("cannot bind quic listener on {addr}"))?;
            info!(%addr, label = "quic", "listening");
            quic.push(listener);
        }

        Ok(Self {
            config: Arc::new(config),
            tcp,
            quic,
            tls,
        })
    }

    /// Actual addresses of the TCP-based listeners, in bind order.
    pub fn tcp_addrs(&self) -> Vec<SocketAddr> {
        self.tcp
            .iter()
            .filter_map(|(l, _)| l.local_addr().ok())
            .collect()
    }

    /// Actual addresses of the QUIC listeners, in bind order.
    pub fn quic_addrs(&self) -> Vec<SocketAddr> {
        self.quic
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accepts on every listener until `running` clears.  Admitted
    /// connections are sent to `admitted`; everything else is closed here.
    pub async fn run(
        self,
        running: Arc<AtomicBool>,
        admitted: mpsc::Sender<Box<dyn Connection>>,
    ) -> anyhow::Result<()> {
        let mut tasks = Vec::new();
        for (listener, label) in self.tcp {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                label,
                self.config.clone(),
                self.tls.clone(),
                running.clone(),
                admitted.clone(),
            )));
        }
        for quic_listener in self.quic {
            tasks.push(tokio::spawn(quic_listener.run(
                self.config.clone(),
                running.clone(),
                admitted.clone(),
            )));
        }
        for task in tasks {
            task.await.context("listener task panicked")?;
        }
        Ok(())
    }
}

/// Binds and runs in one step.
pub async fn run_server(
    config: ServerConfig,
    running: Arc<AtomicBool>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) -> anyhow::Result<()> {
    Server::bind(config).await?.run(running, admitted).await
}

/// Creates the admitted-connection channel with the standard backlog.
pub fn admitted_channel() -> (
    mpsc::Sender<Box<dyn Connection>>,
    mpsc::Receiver<Box<dyn Connection>>,
) {
    mpsc::channel(ADMITTED_QUEUE)
}

async fn accept_loop(
    listener: TcpListener,
    label: &'static str,
    config: Arc<ServerConfig>,
    tls: Option<TlsAcceptor>,
    running: Arc<AtomicBool>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    while running.load(Ordering::Relaxed) {
        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                tokio::spawn(handle_socket(
                    stream,
                    peer,
                    label,
                    config.clone(),
                    tls.clone(),
                    admitted.clone(),
                ));
            }
            Ok(Err(e)) => {
                warn!(label, "accept failed: {e}");
            }
            // Poll tick: re-check the flag.
            Err(_) => continue,
        }
    }
    info!(label, "listener down");
}

async fn handle_socket(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    label: &'static str,
    config: Arc<ServerConfig>,
    tls: Option<TlsAcceptor>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    let endpoint = Endpoint::new(peer.ip().to_string(), peer.port());
    let conn = match accept_connection(stream, endpoint.clone(), tls.as_ref(), config.timeout).await
    {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer = %endpoint, label, "detection failed: {e}");
            return;
        }
    };
    debug!(peer = %endpoint, label, transport = %conn.socket_type(), "transport confirmed");
    authenticate_and_admit(conn, config, admitted).await;
}

/// Runs the handshake on a confirmed connection and hands it over on `OK`.
pub(crate) async fn authenticate_and_admit(
    mut conn: Box<dyn Connection>,
    config: Arc<ServerConfig>,
    admitted: mpsc::Sender<Box<dyn Connection>>,
) {
    let code =
        handshake::authenticate(&mut *conn, &config.auth, &config.display, config.timeout).await;
    let info = conn.info();
    info!(
        peer = %info.endpoint,
        transport = %info.socket_type,
        id = %info.id,
        result = %code,
        "connection attempt resolved"
    );
    if code != ResultCode::Ok {
        // authenticate() already closed the connection.
        return;
    }
    if let Err(mpsc::error::SendError(mut conn)) = admitted.send(conn).await {
        warn!("session layer is gone, closing admitted connection");
        conn.close().await;
    }
}
