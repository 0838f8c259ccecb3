//! xgate connection-admission server — entry point.
//!
//! Binds the configured listeners, runs transport detection and the
//! authentication handshake on every accepted socket, and logs each admitted
//! connection.  The session layer proper attaches to the admitted-connection
//! channel; this binary stands in for it by logging an info snapshot of
//! every connection it would hand over.
//!
//! # Usage
//!
//! ```text
//! xgate-server [OPTIONS]
//!
//! Options:
//!   --bind-tcp  <ADDR>   plain listener, repeatable (e.g. 0.0.0.0:14500)
//!   --bind-ssl  <ADDR>   TLS listener, repeatable
//!   --bind-ws   <ADDR>   WebSocket listener, repeatable
//!   --bind-wss  <ADDR>   WebSocket-over-TLS listener, repeatable
//!   --bind-quic <ADDR>   QUIC (UDP) listener, repeatable
//!   --auth      <SEL>    backend selector [default: none]
//!   --display   <DISP>   display to admit connections to [default: :0]
//!   --timeout-secs <N>   per-connection handshake bound [default: 10]
//!   --ssl-cert / --ssl-key
//!   --config    <FILE>   TOML file; CLI flags win over file values
//! ```
//!
//! Every TCP-based listener runs the same byte-level detection, so a `tcp`
//! port still upgrades sockets that open with TLS or an HTTP GET; the
//! per-scheme flags exist for operator intent and log labels.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use xgate_core::auth::parse_backend;
use xgate_net::config::{FileConfig, ServerConfig};
use xgate_net::listener::{admitted_channel, run_server};
use xgate_net::tls::TlsConfig;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Connection-admission server: transport detection, in-place upgrades, and
/// challenge-response authentication for tcp/ssl/ws/wss/quic sockets.
#[derive(Debug, Parser)]
#[command(name = "xgate-server", about = "xgate connection-admission server", version)]
struct Cli {
    /// Plain TCP listener address; may be given more than once.
    #[arg(long, env = "XGATE_BIND_TCP")]
    bind_tcp: Vec<SocketAddr>,

    /// TLS listener address; may be given more than once.
    #[arg(long, env = "XGATE_BIND_SSL")]
    bind_ssl: Vec<SocketAddr>,

    /// WebSocket listener address; may be given more than once.
    #[arg(long, env = "XGATE_BIND_WS")]
    bind_ws: Vec<SocketAddr>,

    /// WebSocket-over-TLS listener address; may be given more than once.
    #[arg(long, env = "XGATE_BIND_WSS")]
    bind_wss: Vec<SocketAddr>,

    /// QUIC (UDP) listener address; may be given more than once.
    #[arg(long, env = "XGATE_BIND_QUIC")]
    bind_quic: Vec<SocketAddr>,

    /// Authentication backend selector, e.g. `allow` or
    /// `file:filename=/etc/xgate/password`.
    #[arg(long, env = "XGATE_AUTH")]
    auth: Option<String>,

    /// The display admitted connections are attached to.
    #[arg(long, env = "XGATE_DISPLAY")]
    display: Option<String>,

    /// Bound, in seconds, on detection plus the handshake per connection.
    #[arg(long, env = "XGATE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// PEM certificate chain for TLS and QUIC listeners.
    #[arg(long, env = "XGATE_SSL_CERT")]
    ssl_cert: Option<PathBuf>,

    /// PEM private key matching --ssl-cert.
    #[arg(long, env = "XGATE_SSL_KEY")]
    ssl_key: Option<PathBuf>,

    /// TOML configuration file; CLI flags override its values.
    #[arg(long, env = "XGATE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Merges the optional config file and the CLI flags (flags win) into
    /// the effective [`ServerConfig`].
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let pick_binds = |cli: Vec<SocketAddr>, file: Vec<SocketAddr>| {
            if cli.is_empty() {
                file
            } else {
                cli
            }
        };

        let auth_selector = self
            .auth
            .or(file.auth)
            .unwrap_or_else(|| "none".to_string());
        let auth = parse_backend(&auth_selector)
            .with_context(|| format!("invalid --auth selector {auth_selector:?}"))?;

        let cert = self.ssl_cert.or(file.ssl_cert);
        let key = self.ssl_key.or(file.ssl_key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
            (None, None) => None,
            _ => anyhow::bail!("--ssl-cert and --ssl-key must be given together"),
        };

        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            bind_tcp: pick_binds(self.bind_tcp, file.bind_tcp),
            bind_ssl: pick_binds(self.bind_ssl, file.bind_ssl),
            bind_ws: pick_binds(self.bind_ws, file.bind_ws),
            bind_wss: pick_binds(self.bind_wss, file.bind_wss),
            bind_quic: pick_binds(self.bind_quic, file.bind_quic),
            auth,
            display: self.display.or(file.display).unwrap_or(defaults.display),
            timeout: self
                .timeout_secs
                .or(file.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            tls,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging; level overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_server_config()?;

    if config.tcp_binds().is_empty() && config.bind_quic.is_empty() {
        anyhow::bail!("no listeners configured; give at least one --bind-* address");
    }

    info!(
        auth = config.auth.name(),
        display = %config.display,
        "xgate-server starting"
    );

    // Shutdown flag shared by every accept loop.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("cannot listen for Ctrl+C: {e}"),
        }
    });

    // Stand-in session layer: log each admitted connection and close it.
    let (admitted_tx, mut admitted_rx) = admitted_channel();
    tokio::spawn(async move {
        while let Some(mut conn) = admitted_rx.recv().await {
            match serde_json::to_string(&conn.info()) {
                Ok(snapshot) => info!("admitted: {snapshot}"),
                Err(e) => error!("cannot serialize connection info: {e}"),
            }
            conn.close().await;
        }
    });

    run_server(config, running, admitted_tx).await?;

    info!("xgate-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
