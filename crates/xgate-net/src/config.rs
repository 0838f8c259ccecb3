//! Server configuration.
//!
//! The effective [`ServerConfig`] is assembled by the binary from an
//! optional TOML file plus command-line flags; flags win.  [`FileConfig`]
//! mirrors the file layout with every field optional.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use xgate_core::AuthBackend;

use crate::tls::TlsConfig;

/// Default bound on detection, TLS/WebSocket upgrades, and the
/// authentication handshake, per connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The effective server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Plain TCP listeners; detection may still upgrade individual sockets.
    pub bind_tcp: Vec<SocketAddr>,
    /// Listeners expected to carry TLS.  Detection is identical to
    /// `bind_tcp`; the split only affects logging.
    pub bind_ssl: Vec<SocketAddr>,
    pub bind_ws: Vec<SocketAddr>,
    pub bind_wss: Vec<SocketAddr>,
    /// QUIC (UDP) listeners.
    pub bind_quic: Vec<SocketAddr>,
    /// The verifier every admitted connection must pass.
    pub auth: AuthBackend,
    /// The display connections are admitted to; consulted by `multifile`.
    pub display: String,
    /// Per-connection bound on detection and the handshake.
    pub timeout: Duration,
    /// Server certificate material; required for ssl/wss/quic listeners and
    /// for upgrading TLS bytes seen on a tcp listener.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_tcp: Vec::new(),
            bind_ssl: Vec::new(),
            bind_ws: Vec::new(),
            bind_wss: Vec::new(),
            bind_quic: Vec::new(),
            auth: AuthBackend::None,
            display: ":0".to_string(),
            timeout: DEFAULT_TIMEOUT,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// All TCP-based bind addresses with the socket-type label each
    /// listener logs under.
    pub fn tcp_binds(&self) -> Vec<(SocketAddr, &'static str)> {
        let mut binds = Vec::new();
        binds.extend(self.bind_tcp.iter().map(|a| (*a, "tcp")));
        binds.extend(self.bind_ssl.iter().map(|a| (*a, "ssl")));
        binds.extend(self.bind_ws.iter().map(|a| (*a, "ws")));
        binds.extend(self.bind_wss.iter().map(|a| (*a, "wss")));
        binds
    }
}

/// On-disk configuration file contents, all fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub bind_tcp: Vec<SocketAddr>,
    #[serde(default)]
    pub bind_ssl: Vec<SocketAddr>,
    #[serde(default)]
    pub bind_ws: Vec<SocketAddr>,
    #[serde(default)]
    pub bind_wss: Vec<SocketAddr>,
    #[serde(default)]
    pub bind_quic: Vec<SocketAddr>,
    /// Backend selector, e.g. `allow` or `file:filename=/path`.
    pub auth: Option<String>,
    pub display: Option<String>,
    pub timeout_secs: Option<u64>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
}

impl FileConfig {
    /// Loads and parses a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_has_no_listeners_and_no_auth() {
        let config = ServerConfig::default();
        assert!(config.tcp_binds().is_empty());
        assert!(config.bind_quic.is_empty());
        assert_eq!(config.auth, AuthBackend::None);
        assert_eq!(config.display, ":0");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_tcp_binds_label_each_listener() {
        let config = ServerConfig {
            bind_tcp: vec!["127.0.0.1:14500".parse().unwrap()],
            bind_wss: vec!["127.0.0.1:14503".parse().unwrap()],
            ..ServerConfig::default()
        };
        let binds = config.tcp_binds();
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].1, "tcp");
        assert_eq!(binds[1].1, "wss");
    }

    #[test]
    fn test_file_config_parses_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
bind_tcp = ["127.0.0.1:14500"]
bind_quic = ["127.0.0.1:14510"]
auth = "file:filename=/etc/xgate/password"
display = ":7"
timeout_secs = 30
ssl_cert = "/etc/xgate/cert.pem"
ssl_key = "/etc/xgate/key.pem"
"#
        )
        .unwrap();
        let config = FileConfig::load(f.path()).unwrap();
        assert_eq!(config.bind_tcp.len(), 1);
        assert_eq!(config.bind_quic.len(), 1);
        assert_eq!(config.auth.as_deref(), Some("file:filename=/etc/xgate/password"));
        assert_eq!(config.display.as_deref(), Some(":7"));
        assert_eq!(config.timeout_secs, Some(30));
        assert_eq!(config.ssl_key.as_deref(), Some(Path::new("/etc/xgate/key.pem")));
    }

    #[test]
    fn test_file_config_rejects_unknown_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "bind_tpc = [\"127.0.0.1:1\"]\n").unwrap();
        assert!(FileConfig::load(f.path()).is_err());
    }
}
