//! [`Connection`] over any plain byte stream.
//!
//! [`StreamConnection`] adapts anything `AsyncRead + AsyncWrite` — a TCP
//! socket, a TLS stream, a joined pair of QUIC stream halves — to the
//! [`Connection`] trait.  [`PrefixedStream`] replays bytes that the detector
//! had to consume while sniffing, so an upgrade never loses data.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use xgate_core::{Connection, ConnectionError, ConnectionInfo, Endpoint, SocketType};

/// Largest single read issued against the underlying stream.
const MAX_READ: usize = 64 * 1024;

/// A [`Connection`] backed by a plain duplex byte stream.
pub struct StreamConnection<S> {
    stream: S,
    socket_type: SocketType,
    endpoint: Endpoint,
    id: Uuid,
    bytes_read: u64,
    bytes_written: u64,
    /// Set by `close()`; reads and writes fail afterwards.
    closed: bool,
    /// Set when the peer half-closed the stream; reads keep returning EOF.
    eof: bool,
}

impl<S> StreamConnection<S> {
    pub fn new(stream: S, socket_type: SocketType, endpoint: Endpoint) -> Self {
        Self {
            stream,
            socket_type,
            endpoint,
            id: Uuid::new_v4(),
            bytes_read: 0,
            bytes_written: 0,
            closed: false,
            eof: false,
        }
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if self.eof {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; max.min(MAX_READ).max(1)];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
            return Ok(Bytes::new());
        }
        buf.truncate(n);
        self.bytes_read += n as u64;
        Ok(Bytes::from(buf))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        self.closed || self.eof
    }

    fn info(&self) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(self.socket_type, &self.endpoint);
        info.id = self.id;
        info.bytes_read = self.bytes_read;
        info.bytes_written = self.bytes_written;
        info.closed = self.closed;
        info
    }
}

/// A byte stream with some already-read bytes put back in front.
///
/// The detector cannot always peek: once a TLS session is established, the
/// only way to see the plaintext is to read it.  Whatever it reads while
/// classifying is replayed through this wrapper so the next layer (WebSocket
/// handshake, session protocol) sees an untouched stream.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 10000)
    }

    #[tokio::test]
    async fn test_stream_connection_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamConnection::new(a, SocketType::Tcp, test_endpoint());
        let mut right = StreamConnection::new(b, SocketType::Tcp, test_endpoint());

        assert_eq!(left.write(b"hello").await.unwrap(), 5);
        let got = right.read(1024).await.unwrap();
        assert_eq!(&got[..], b"hello");
        assert_eq!(left.info().bytes_written, 5);
        assert_eq!(right.info().bytes_read, 5);
    }

    #[tokio::test]
    async fn test_read_respects_max() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamConnection::new(a, SocketType::Tcp, test_endpoint());
        let mut right = StreamConnection::new(b, SocketType::Tcp, test_endpoint());

        left.write(b"abcdef").await.unwrap();
        let got = right.read(2).await.unwrap();
        assert_eq!(&got[..], b"ab");
        let got = right.read(100).await.unwrap();
        assert_eq!(&got[..], b"cdef");
    }

    #[tokio::test]
    async fn test_peer_close_reads_as_eof() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = StreamConnection::new(a, SocketType::Tcp, test_endpoint());
        let mut right = StreamConnection::new(b, SocketType::Tcp, test_endpoint());

        left.close().await;
        assert_eq!(right.read(16).await.unwrap().len(), 0);
        assert!(right.is_closed());
        // EOF is sticky.
        assert_eq!(right.read(16).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_use_after_close_fails() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut conn = StreamConnection::new(a, SocketType::Tcp, test_endpoint());
        conn.close().await;
        conn.close().await; // idempotent
        assert!(conn.is_closed());
        assert!(matches!(
            conn.read(1).await,
            Err(ConnectionError::Closed)
        ));
        assert!(matches!(
            conn.write(b"x").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix_first() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = a;
        writer.write_all(b" world").await.unwrap();

        let mut prefixed = PrefixedStream::new(&b"hello"[..], b);
        let mut buf = [0u8; 11];
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_prefixed_stream_partial_prefix_reads() {
        let (_a, b) = tokio::io::duplex(1024);
        let mut prefixed = PrefixedStream::new(&b"abcd"[..], b);
        let mut buf = [0u8; 2];
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cd");
    }
}
