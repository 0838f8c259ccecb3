//! [`Connection`] over a WebSocket.
//!
//! The session protocol is a byte stream; WebSocket frames are just the
//! container.  Reads therefore flatten incoming binary (and text) frames
//! back into bytes, keeping any unread tail of a frame for the next read.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use xgate_core::{Connection, ConnectionError, ConnectionInfo, Endpoint, SocketType};

/// A [`Connection`] backed by an established WebSocket.
pub struct WsConnection<S> {
    ws: WebSocketStream<S>,
    socket_type: SocketType,
    endpoint: Endpoint,
    id: Uuid,
    bytes_read: u64,
    bytes_written: u64,
    closed: bool,
    eof: bool,
    /// Unread tail of the last frame.
    leftover: Bytes,
}

impl<S> WsConnection<S> {
    /// Wraps an already-upgraded WebSocket.  `socket_type` records whether
    /// the socket underneath is plain (`ws`) or TLS (`wss`).
    pub fn new(ws: WebSocketStream<S>, socket_type: SocketType, endpoint: Endpoint) -> Self {
        Self {
            ws,
            socket_type,
            endpoint,
            id: Uuid::new_v4(),
            bytes_read: 0,
            bytes_written: 0,
            closed: false,
            eof: false,
            leftover: Bytes::new(),
        }
    }

    fn take_leftover(&mut self, max: usize) -> Bytes {
        let n = self.leftover.len().min(max);
        let out = self.leftover.split_to(n);
        self.bytes_read += out.len() as u64;
        out
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
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
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(max));
        }
        if self.eof {
            return Ok(Bytes::new());
        }
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.leftover = Bytes::from(data);
                    return Ok(self.take_leftover(max));
                }
                Some(Ok(Message::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.leftover = Bytes::from(text.into_bytes());
                    return Ok(self.take_leftover(max));
                }
                // Control frames are handled by tungstenite; nothing for us.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.eof = true;
                    return Ok(Bytes::new());
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    self.eof = true;
                    return Ok(Bytes::new());
                }
                Some(Err(WsError::Io(e))) => return Err(ConnectionError::Io(e)),
                Some(Err(e)) => return Err(ConnectionError::Protocol(e.to_string())),
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        match self.ws.send(Message::Binary(buf.to_vec())).await {
            Ok(()) => {
                self.bytes_written += buf.len() as u64;
                Ok(buf.len())
            }
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Err(ConnectionError::Closed)
            }
            Err(WsError::Io(e)) => Err(ConnectionError::Io(e)),
            Err(e) => Err(ConnectionError::Protocol(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.ws.close(None).await;
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

// ── Tests ─────────────────────────────────────────────────────────────────────
