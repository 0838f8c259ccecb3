//! QUIC multiplexer tests: a real listener on loopback UDP, a real client
//! driver, and both ALPN worlds — the HTTP/3 WebSocket upgrade path and the
//! raw per-stream tunnel.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use xgate_core::auth::ChallengeHandler;
use xgate_core::{AuthBackend, Connection, ResultCode};
use xgate_net::config::ServerConfig;
use xgate_net::handshake;
use xgate_net::listener::{admitted_channel, Server};
use xgate_net::quic::client::connect_raw;
use xgate_net::quic::{QuicClientMux, QuicDriver};
use xgate_net::tls::{ClientTlsConfig, TlsConfig, VerifyMode};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Certs {
    cert: tempfile::NamedTempFile,
    key: tempfile::NamedTempFile,
}

impl Certs {
    fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        write!(cert_file, "{}", cert.cert.pem()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        write!(key_file, "{}", cert.key_pair.serialize_pem()).unwrap();
        Self {
            cert: cert_file,
            key: key_file,
        }
    }

    fn server(&self) -> TlsConfig {
        TlsConfig {
            cert: self.cert.path().to_path_buf(),
            key: self.key.path().to_path_buf(),
        }
    }

    fn trusting_client(&self) -> ClientTlsConfig {
        ClientTlsConfig {
            ca: Some(self.cert.path().to_path_buf()),
            verify_mode: VerifyMode::Required,
        }
    }
}

struct TestServer {
    port: u16,
    running: Arc<AtomicBool>,
    admitted: mpsc::Receiver<Box<dyn Connection>>,
}

impl TestServer {
    async fn start(auth: AuthBackend, certs: &Certs) -> Self {
        let config = ServerConfig {
            bind_quic: vec!["127.0.0.1:0".parse().unwrap()],
            auth,
            timeout: TIMEOUT,
            tls: Some(certs.server()),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        let port = server.quic_addrs()[0].port();
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = admitted_channel();
        tokio::spawn(server.run(running.clone(), tx));
        Self {
            port,
            running,
            admitted: rx,
        }
    }

    async fn admitted(&mut self) -> Box<dyn Connection> {
        tokio::time::timeout(TIMEOUT, self.admitted.recv())
            .await
            .expect("no connection was admitted in time")
            .expect("admission channel closed")
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn secret_handler(secret: &str) -> (tempfile::NamedTempFile, ChallengeHandler) {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(f, "{secret}").unwrap();
    let handler = ChallengeHandler::File {
        path: f.path().to_path_buf(),
    };
    (f, handler)
}

#[tokio::test]
async fn test_h3_upgrade_authenticates_and_carries_bytes() {
    let certs = Certs::generate();
    let mut server = TestServer::start(AuthBackend::Allow, &certs).await;

    let driver = QuicDriver::client().unwrap();
    let mux = QuicClientMux::connect(
        &driver,
        "127.0.0.1",
        server.port,
        &certs.trusting_client(),
        TIMEOUT,
    )
    .await
    .unwrap();

    let mut conn = mux.open("/").await.unwrap();
    let (_f, handler) = secret_handler("open sesame");
    let code = handshake::respond(&mut conn, Some(&handler), None, TIMEOUT).await;
    assert_eq!(code, ResultCode::Ok);

    let mut admitted = server.admitted().await;
    assert_eq!(admitted.socket_type().to_string(), "quic");

    // The session flows over the same stream the handshake used.
    conn.write(b"ping").await.unwrap();
    assert_eq!(&admitted.read(64).await.unwrap()[..], b"ping");
    admitted.write(b"pong").await.unwrap();
    assert_eq!(&conn.read(64).await.unwrap()[..], b"pong");

    conn.close().await;
    admitted.close().await;
    mux.close();
    driver.shutdown();
    server.stop();
}

#[tokio::test]
async fn test_one_mux_carries_independent_streams() {
    let certs = Certs::generate();
    let mut server = TestServer::start(AuthBackend::None, &certs).await;

    let driver = QuicDriver::client().unwrap();
    let mux = QuicClientMux::connect(
        &driver,
        "127.0.0.1",
        server.port,
        &certs.trusting_client(),
        TIMEOUT,
    )
    .await
    .unwrap();

    let mut first = mux.open("/").await.unwrap();
    let mut second = mux.open("/").await.unwrap();
    assert_ne!(
        first.info().extra.get("stream-id"),
        second.info().extra.get("stream-id")
    );

    assert_eq!(
        handshake::respond(&mut first, None, None, TIMEOUT).await,
        ResultCode::Ok
    );
    assert_eq!(
        handshake::respond(&mut second, None, None, TIMEOUT).await,
        ResultCode::Ok
    );

    let mut admitted_a = server.admitted().await;
    let mut admitted_b = server.admitted().await;

    // Bytes stay on their own stream.
    first.write(b"first").await.unwrap();
    second.write(b"second").await.unwrap();
    let got_a = admitted_a.read(64).await.unwrap();
    let got_b = admitted_b.read(64).await.unwrap();
    let mut got = vec![got_a.to_vec(), got_b.to_vec()];
    got.sort();
    assert_eq!(got, vec![b"first".to_vec(), b"second".to_vec()]);

    first.close().await;
    second.close().await;
    mux.close();
    driver.shutdown();
    server.stop();
}

#[tokio::test]
async fn test_rejected_stream_does_not_block_the_mux() {
    let certs = Certs::generate();
    let mut server = TestServer::start(AuthBackend::Allow, &certs).await;

    let driver = QuicDriver::client().unwrap();
    let mux = QuicClientMux::connect(
        &driver,
        "127.0.0.1",
        server.port,
        &certs.trusting_client(),
        TIMEOUT,
    )
    .await
    .unwrap();

    // A stream that answers the challenge with nothing is denied, but the
    // mux itself must stay usable for the next stream.
    let mut denied = mux.open("/").await.unwrap();
    assert_eq!(
        handshake::respond(&mut denied, None, None, TIMEOUT).await,
        ResultCode::PasswordRequired
    );

    let mut ok = mux.open("/").await.unwrap();
    let (_f, handler) = secret_handler("still here");
    assert_eq!(
        handshake::respond(&mut ok, Some(&handler), None, TIMEOUT).await,
        ResultCode::Ok
    );
    server.admitted().await;

    ok.close().await;
    mux.close();
    driver.shutdown();
    server.stop();
}

#[tokio::test]
async fn test_raw_alpn_maps_a_stream_straight_to_a_connection() {
    let certs = Certs::generate();
    let mut server = TestServer::start(AuthBackend::None, &certs).await;

    let driver = QuicDriver::client().unwrap();
    let mut conn = connect_raw(
        &driver,
        "127.0.0.1",
        server.port,
        &certs.trusting_client(),
        TIMEOUT,
    )
    .await
    .unwrap();

    let code = handshake::respond(&mut *conn, None, None, TIMEOUT).await;
    assert_eq!(code, ResultCode::Ok);

    let mut admitted = server.admitted().await;
    assert_eq!(admitted.socket_type().to_string(), "quic");
    conn.write(b"no framing here").await.unwrap();
    assert_eq!(&admitted.read(64).await.unwrap()[..], b"no framing here");

    conn.close().await;
    admitted.close().await;
    driver.shutdown();
    server.stop();
}
