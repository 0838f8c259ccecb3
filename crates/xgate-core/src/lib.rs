//! # xgate-core
//!
//! Shared library for the xgate connection-admission server containing the
//! transport-agnostic connection abstraction, the authentication engine,
//! and the external result codes.
//!
//! This crate is used by the networking crate (`xgate-net`) and by anything
//! that needs to reason about admission outcomes.  It has zero dependencies
//! on sockets, TLS stacks, or OS APIs.
//!
//! # What lives here
//!
//! - **`connection`** – The [`Connection`] trait: one logical duplex byte
//!   stream to one peer, whatever the wire transport underneath (plain TCP,
//!   TLS, WebSocket, WebSocket-over-TLS, or a QUIC/HTTP-3 stream).  Every
//!   transport in `xgate-net` implements it.
//!
//! - **`auth`** – The challenge-response authentication engine: a closed set
//!   of verifier backends (`none`, `allow`, `reject`, `fail`, `file`,
//!   `multifile`), the per-attempt [`Challenge`], the digest mechanisms, and
//!   the selector syntax used to configure a backend from a string.
//!
//! - **`result`** – The stable, externally visible result codes
//!   (`OK`, `CONNECTION_FAILED`, ...) and the exact mapping from
//!   authentication outcomes to them.

pub mod auth;
pub mod connection;
pub mod result;

// Re-export the most-used types at the crate root so callers can write
// `xgate_core::Connection` instead of `xgate_core::connection::Connection`.
pub use auth::{
    AuthBackend, AuthError, AuthResponse, Challenge, ChallengeHandler, DigestMode,
    VerificationResult,
};
pub use connection::{Connection, ConnectionError, ConnectionInfo, Endpoint, SocketType};
pub use result::ResultCode;
