//! TLS setup for server sockets, client connectors, and QUIC.
//!
//! Certificates and keys are loaded from PEM files.  The client side
//! supports three verify modes: `none` skips certificate verification
//! entirely, while `peer`/`optional` and `required` both verify against the
//! configured CA bundle (or the bundled webpki roots when no CA is given).
//! A verification failure is surfaced as its own error so callers can map
//! it to `SSL_CERTIFICATE_VERIFY_FAILURE` rather than a generic failure.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// How the client treats the server's certificate chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Accept any certificate; no verification at all.
    None,
    /// Verify the chain.  Kept distinct from `Required` because the two map
    /// to different modes on the server side of mutual TLS.
    Peer,
    /// Verify the chain; failure is fatal.
    #[default]
    Required,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::None => "none",
            VerifyMode::Peer => "peer",
            VerifyMode::Required => "required",
        }
    }

    /// Whether this mode verifies the peer certificate at all.
    pub fn verifies(&self) -> bool {
        !matches!(self, VerifyMode::None)
    }
}

impl std::fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifyMode {
    type Err = TlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(VerifyMode::None),
            "peer" | "optional" => Ok(VerifyMode::Peer),
            "required" => Ok(VerifyMode::Required),
            other => Err(TlsError::UnknownVerifyMode(other.to_string())),
        }
    }
}

/// Server-side TLS material.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM certificate chain presented to clients.
    pub cert: PathBuf,
    /// PEM private key matching the chain's end-entity certificate.
    pub key: PathBuf,
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// PEM bundle of trusted roots; the webpki roots are used when absent.
    pub ca: Option<PathBuf>,
    pub verify_mode: VerifyMode,
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} contains no usable PEM {kind}")]
    EmptyPem { path: PathBuf, kind: &'static str },

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    #[error("unknown ssl verify mode: {0:?}")]
    UnknownVerifyMode(String),
}

/// Installs the process-wide crypto provider.  Only the first call wins;
/// repeated calls are no-ops.
pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::EmptyPem {
            path: path.to_path_buf(),
            kind: "certificate",
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::EmptyPem {
            path: path.to_path_buf(),
            kind: "private key",
        })
}

/// Builds the rustls server config used by both TLS sockets and QUIC.
pub fn build_server_config(
    tls: &TlsConfig,
    alpn: &[&[u8]],
) -> Result<rustls::ServerConfig, TlsError> {
    ensure_crypto_provider();
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Builds a [`TlsAcceptor`] for TLS-upgraded TCP sockets.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    Ok(TlsAcceptor::from(Arc::new(build_server_config(tls, &[])?)))
}

/// Builds the rustls client config for outbound TLS and QUIC connections.
pub fn build_client_config(
    tls: &ClientTlsConfig,
    alpn: &[&[u8]],
) -> Result<rustls::ClientConfig, TlsError> {
    ensure_crypto_provider();
    let mut config = if tls.verify_mode.verifies() {
        let mut roots = RootCertStore::empty();
        match &tls.ca {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert)?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerify::new()))
            .with_no_client_auth()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Builds a [`TlsConnector`] for outbound `ssl://` and `wss://` connections.
pub fn build_connector(tls: &ClientTlsConfig) -> Result<TlsConnector, TlsError> {
    Ok(TlsConnector::from(Arc::new(build_client_config(tls, &[])?)))
}

/// Whether an I/O error from a TLS handshake is a certificate verification
/// failure.  tokio-rustls wraps the rustls error inside `std::io::Error`.
pub fn is_certificate_verify_error(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false)
}

mod danger {
    //! Certificate verifier for `verify-mode=none`.
    //!
    //! Accepts any chain but still checks handshake signatures, so the
    //! session keys are at least bound to the presented certificate.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    #[derive(Debug)]
    pub(super) struct NoVerify(CryptoProvider);

    impl NoVerify {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
