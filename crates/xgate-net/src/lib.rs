//! # xgate-net
//!
//! Network plumbing for xgate: listeners, transport detection and in-place
//! upgrade, TLS, WebSocket, the wire authentication handshake, client-side
//! connectors, and the QUIC/HTTP-3 multiplexer.
//!
//! The flow on the server side is always the same:
//!
//! 1. A listener accepts a raw socket ([`listener`]).
//! 2. The detector sniffs the first bytes and upgrades the socket in place
//!    to its real transport ([`detect`]) — TLS, WebSocket, both, or neither.
//! 3. The authentication handshake runs over the resulting
//!    [`xgate_core::Connection`] ([`handshake`]) and resolves to exactly one
//!    [`xgate_core::ResultCode`].
//! 4. Admitted connections are handed to the session layer.
//!
//! QUIC sockets skip detection: the negotiated ALPN decides between the
//! HTTP/3 WebSocket multiplexer and raw bidirectional streams ([`quic`]).

pub mod config;
pub mod connect;
pub mod detect;
pub mod handshake;
pub mod listener;
pub mod quic;
pub mod stream;
pub mod tls;
pub mod uri;
pub mod websocket;

pub use config::ServerConfig;
pub use connect::{client_connect, ClientOptions};
pub use detect::{accept_connection, AcceptError};
pub use listener::Server;
pub use stream::StreamConnection;
pub use tls::{ClientTlsConfig, TlsConfig, VerifyMode};
pub use uri::TargetUri;
