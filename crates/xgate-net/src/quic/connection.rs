//! Per-stream state machine and the [`Connection`] over an HTTP/3 stream.
//!
//! Every tunneled stream moves through an explicit lifecycle:
//!
//! ```text
//! Requested → HeadersSent → Accepted → Open → Closed
//! ```
//!
//! Writes issued before the peer accepts the upgrade are buffered FIFO and
//! flushed exactly once, in order, the moment the 200 response lands
//! (`Accepted`); buffering is then permanently retired (`Open`).  A rejected
//! upgrade moves straight to `Closed` and the buffer is dropped.
//!
//! Incoming events are routed by stream id through a [`StreamMap`]; events
//! for ids with no entry are logged and ignored, never fatal.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use xgate_core::{Connection, ConnectionError, ConnectionInfo, Endpoint, SocketType};

use super::h3::{self, Frame, FrameReader, FRAME_DATA};

/// Lifecycle of one tunneled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// The stream is open locally; nothing sent yet.
    Requested = 0,
    /// The upgrade request is on the wire; awaiting the peer's verdict.
    HeadersSent = 1,
    /// The peer accepted; buffered writes are being flushed.
    Accepted = 2,
    /// Fully established; writes go straight to the wire.
    Open = 3,
    /// Closed or rejected; terminal.
    Closed = 4,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Requested => "requested",
            StreamState::HeadersSent => "headers-sent",
            StreamState::Accepted => "accepted",
            StreamState::Open => "open",
            StreamState::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> StreamState {
        match v {
            0 => StreamState::Requested,
            1 => StreamState::HeadersSent,
            2 => StreamState::Accepted,
            3 => StreamState::Open,
            _ => StreamState::Closed,
        }
    }
}

/// Why an upgrade did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RejectReason {
    /// The response was missing the required subprotocol.
    UnsupportedSubprotocol,
    /// The peer answered with a terminal (non-2xx) status.
    Status(u16),
}

/// What the read pump delivers to a stream's consumer.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    /// The peer finished the stream cleanly.
    End,
    Rejected(RejectReason),
    Error(String),
}

/// Routing table from stream id to the consumer of that stream's events.
///
/// One instance exists per QUIC connection; entries are removed when the
/// stream closes.
#[derive(Default)]
pub(crate) struct StreamMap {
    inner: Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>,
}

impl StreamMap {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn insert(&self, stream_id: u64, tx: mpsc::Sender<StreamEvent>) {
        self.inner.lock().await.insert(stream_id, tx);
    }

    pub(crate) async fn remove(&self, stream_id: u64) {
        self.inner.lock().await.remove(&stream_id);
    }

    /// Delivers an event to the stream's consumer.  Events for unknown ids
    /// are logged and dropped; they must never take the connection down.
    pub(crate) async fn dispatch(&self, stream_id: u64, event: StreamEvent) {
        let tx = self.inner.lock().await.get(&stream_id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    debug!(stream_id, "stream consumer gone, dropping event");
                }
            }
            None => warn!(stream_id, "event for unknown stream id, ignoring"),
        }
    }
}

/// WebSocket normal-closure code; doubles as the terminal `:status` sent
/// when a never-accepted stream is closed locally.
const CLOSE_NORMAL: u16 = 1000;

/// Close packet sent as the final DATA frame of an accepted stream:
/// a two-byte big-endian code followed by the reason text.
pub(crate) fn close_packet(code: u16, reason: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(2 + reason.len());
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(reason.as_bytes());
    packet
}

/// The writable half of a tunneled stream, shared between the consumer and
/// the task handling the peer's upgrade response.
pub(crate) struct WriteHalf<W> {
    state: StreamState,
    /// Mirror for non-blocking `info()` snapshots.
    state_mirror: Arc<AtomicU8>,
    /// Writes issued before acceptance, oldest first.
    pending: VecDeque<Bytes>,
    stream: W,
}

impl<W: AsyncWrite + Unpin + Send> WriteHalf<W> {
    pub(crate) fn new(stream: W, state: StreamState, state_mirror: Arc<AtomicU8>) -> Self {
        state_mirror.store(state as u8, Ordering::Relaxed);
        Self {
            state,
            state_mirror,
            pending: VecDeque::new(),
            stream,
        }
    }

    fn set_state(&mut self, state: StreamState) {
        self.state = state;
        self.state_mirror.store(state as u8, Ordering::Relaxed);
    }

    /// Puts the upgrade request on the wire.  Only valid on a freshly
    /// requested stream.
    pub(crate) async fn send_headers(
        &mut self,
        headers: &[(String, String)],
    ) -> Result<(), ConnectionError> {
        let block = h3::encode_headers(headers);
        h3::write_frame(&mut self.stream, h3::FRAME_HEADERS, &block)
            .await
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        self.set_state(StreamState::HeadersSent);
        Ok(())
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        match self.state {
            StreamState::Requested | StreamState::HeadersSent => {
                self.pending.push_back(Bytes::copy_from_slice(data));
                Ok(data.len())
            }
            StreamState::Accepted | StreamState::Open => {
                h3::write_frame(&mut self.stream, FRAME_DATA, data)
                    .await
                    .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
                Ok(data.len())
            }
            StreamState::Closed => Err(ConnectionError::Closed),
        }
    }

    /// The peer accepted the upgrade: flush the buffer FIFO, exactly once,
    /// then retire buffering for good.
    pub(crate) async fn accept(&mut self) -> Result<(), ConnectionError> {
        self.set_state(StreamState::Accepted);
        while let Some(data) = self.pending.pop_front() {
            h3::write_frame(&mut self.stream, FRAME_DATA, &data)
                .await
                .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        }
        self.set_state(StreamState::Open);
        Ok(())
    }

    /// The peer rejected the upgrade: drop the buffer, terminal state.
    pub(crate) async fn reject(&mut self) {
        self.pending.clear();
        self.set_state(StreamState::Closed);
        let _ = self.stream.shutdown().await;
    }

    pub(crate) async fn close(&mut self) {
        match self.state {
            StreamState::Closed => return,
            // An accepted stream says goodbye with a close packet; one that
            // never got accepted answers with a terminal status instead.
            StreamState::Accepted | StreamState::Open => {
                let packet = close_packet(CLOSE_NORMAL, "closing");
                let _ = h3::write_frame(&mut self.stream, FRAME_DATA, &packet).await;
            }
            StreamState::Requested | StreamState::HeadersSent => {
                let headers = [(":status".to_string(), CLOSE_NORMAL.to_string())];
                let block = h3::encode_headers(&headers);
                let _ = h3::write_frame(&mut self.stream, h3::FRAME_HEADERS, &block).await;
            }
        }
        self.pending.clear();
        self.set_state(StreamState::Closed);
        let _ = self.stream.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StreamState {
        self.state
    }
}

/// Decides a tunneled stream's fate from the peer's response headers.
///
/// Accepts when the status is 2xx and the echoed subprotocol list contains
/// the required one; flushes the write buffer on acceptance.
pub(crate) async fn process_response<W: AsyncWrite + Unpin + Send>(
    headers: &[(String, String)],
    write: &Mutex<WriteHalf<W>>,
) -> Result<(), RejectReason> {
    let status: u16 = header_value(headers, ":status")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        write.lock().await.reject().await;
        return Err(RejectReason::Status(status));
    }
    if !subprotocol_accepted(headers, super::SUBPROTOCOL) {
        write.lock().await.reject().await;
        return Err(RejectReason::UnsupportedSubprotocol);
    }
    if let Err(e) = write.lock().await.accept().await {
        debug!("flush after acceptance failed: {e}");
    }
    Ok(())
}

/// First value of a (lowercase) header name.
pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Whether the echoed `sec-websocket-protocol` list names `wanted`.
pub(crate) fn subprotocol_accepted(headers: &[(String, String)], wanted: &str) -> bool {
    header_value(headers, "sec-websocket-protocol")
        .map(|list| list.split(',').any(|p| p.trim() == wanted))
        .unwrap_or(false)
}

/// Reads DATA frames off a stream and routes them through the map until the
/// peer finishes or the stream fails.  Takes the reader rather than the raw
/// stream so it can continue where the upgrade exchange left off.
pub(crate) async fn pump_stream<R>(map: Arc<StreamMap>, stream_id: u64, mut reader: FrameReader<R>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.next().await {
            Ok(Some(Frame {
                frame_type: FRAME_DATA,
                payload,
            })) => map.dispatch(stream_id, StreamEvent::Data(payload)).await,
            Ok(Some(frame)) => {
                debug!(
                    stream_id,
                    frame_type = frame.frame_type,
                    "ignoring non-DATA frame on tunneled stream"
                );
            }
            Ok(None) => {
                map.dispatch(stream_id, StreamEvent::End).await;
                return;
            }
            Err(e) => {
                map.dispatch(stream_id, StreamEvent::Error(e.to_string()))
                    .await;
                return;
            }
        }
    }
}

/// A [`Connection`] over one tunneled HTTP/3 stream.
pub struct QuicWsConnection<W> {
    stream_id: u64,
    endpoint: Endpoint,
    write: Arc<Mutex<WriteHalf<W>>>,
    events: mpsc::Receiver<StreamEvent>,
    map: Arc<StreamMap>,
    state: Arc<AtomicU8>,
    leftover: Bytes,
    closed: bool,
    eof: bool,
    rejected: Option<RejectReason>,
    id: Uuid,
    bytes_read: u64,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> QuicWsConnection<W> {
    pub(crate) fn new(
        stream_id: u64,
        endpoint: Endpoint,
        write: Arc<Mutex<WriteHalf<W>>>,
        events: mpsc::Receiver<StreamEvent>,
        map: Arc<StreamMap>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            stream_id,
            endpoint,
            write,
            events,
            map,
            state,
            leftover: Bytes::new(),
            closed: false,
            eof: false,
            rejected: None,
            id: Uuid::new_v4(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    fn take_leftover(&mut self, max: usize) -> Bytes {
        let n = self.leftover.len().min(max);
        let out = self.leftover.split_to(n);
        self.bytes_read += out.len() as u64;
        out
    }

    fn rejection_error(reason: &RejectReason) -> ConnectionError {
        match reason {
            RejectReason::UnsupportedSubprotocol => ConnectionError::UnsupportedSubprotocol,
            RejectReason::Status(status) => {
                ConnectionError::Protocol(format!("upgrade rejected with status {status}"))
            }
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Connection for QuicWsConnection<W> {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn socket_type(&self) -> SocketType {
        SocketType::Quic
    }

    async fn read(&mut self, max: usize) -> Result<Bytes, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(max));
        }
        if let Some(reason) = &self.rejected {
            return Err(Self::rejection_error(reason));
        }
        if self.eof {
            return Ok(Bytes::new());
        }
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Data(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.leftover = data;
                    return Ok(self.take_leftover(max));
                }
                Some(StreamEvent::End) | None => {
                    self.eof = true;
                    return Ok(Bytes::new());
                }
                Some(StreamEvent::Rejected(reason)) => {
                    let err = Self::rejection_error(&reason);
                    self.rejected = Some(reason);
                    return Err(err);
                }
                Some(StreamEvent::Error(e)) => {
                    return Err(ConnectionError::Protocol(e));
                }
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let n = self.write.lock().await.write(buf).await?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.write.lock().await.close().await;
        self.map.remove(self.stream_id).await;
    }

    fn is_closed(&self) -> bool {
        self.closed || self.eof
    }

    fn info(&self) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(SocketType::Quic, &self.endpoint);
        info.id = self.id;
        info.bytes_read = self.bytes_read;
        info.bytes_written = self.bytes_written;
        info.closed = self.closed;
        info.extra
            .insert("stream-id".to_string(), self.stream_id.to_string());
        info.extra.insert(
            "state".to_string(),
            StreamState::from_u8(self.state.load(Ordering::Relaxed))
                .as_str()
                .to_string(),
        );
        info
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_half(
        state: StreamState,
    ) -> (
        Arc<Mutex<WriteHalf<tokio::io::DuplexStream>>>,
        FrameReader<tokio::io::DuplexStream>,
        Arc<AtomicU8>,
    ) {
        let (tx, rx) = tokio::io::duplex(4096);
        let mirror = Arc::new(AtomicU8::new(0));
        (
            Arc::new(Mutex::new(WriteHalf::new(tx, state, mirror.clone()))),
            FrameReader::new(rx),
            mirror,
        )
    }

    fn response(status: &str, subprotocol: Option<&str>) -> Vec<(String, String)> {
        let mut headers = vec![(":status".to_string(), status.to_string())];
        if let Some(p) = subprotocol {
            headers.push(("sec-websocket-protocol".to_string(), p.to_string()));
        }
        headers
    }

    #[tokio::test]
    async fn test_writes_before_acceptance_buffer_then_flush_in_order() {
        let (write, mut reader, _mirror) = write_half(StreamState::HeadersSent);

        write.lock().await.write(b"first").await.unwrap();
        write.lock().await.write(b"second").await.unwrap();

        // Nothing on the wire while pending.
        assert_eq!(write.lock().await.pending.len(), 2);

        process_response(&response("200", Some("xpra")), &write)
            .await
            .unwrap();

        let a = reader.next().await.unwrap().unwrap();
        let b = reader.next().await.unwrap().unwrap();
        assert_eq!(&a.payload[..], b"first");
        assert_eq!(&b.payload[..], b"second");
        // Buffering is retired: nothing left to flush twice.
        assert!(write.lock().await.pending.is_empty());
        assert_eq!(write.lock().await.state(), StreamState::Open);
    }

    #[tokio::test]
    async fn test_writes_after_acceptance_go_straight_to_the_wire() {
        let (write, mut reader, _mirror) = write_half(StreamState::Open);
        write.lock().await.write(b"direct").await.unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FRAME_DATA);
        assert_eq!(&frame.payload[..], b"direct");
    }

    #[tokio::test]
    async fn test_missing_subprotocol_rejects_and_drops_buffer() {
        let (write, _reader, mirror) = write_half(StreamState::HeadersSent);
        write.lock().await.write(b"never sent").await.unwrap();

        let result = process_response(&response("200", None), &write).await;
        assert_eq!(result, Err(RejectReason::UnsupportedSubprotocol));
        assert!(write.lock().await.pending.is_empty());
        assert_eq!(
            StreamState::from_u8(mirror.load(Ordering::Relaxed)),
            StreamState::Closed
        );
        // Terminal: further writes fail.
        assert!(matches!(
            write.lock().await.write(b"x").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_non_2xx_status_rejects() {
        let (write, _reader, _mirror) = write_half(StreamState::HeadersSent);
        let result = process_response(&response("403", Some("xpra")), &write).await;
        assert_eq!(result, Err(RejectReason::Status(403)));
    }

    #[test]
    fn test_subprotocol_list_matching() {
        let headers = vec![(
            "sec-websocket-protocol".to_string(),
            "chat, xpra".to_string(),
        )];
        assert!(subprotocol_accepted(&headers, "xpra"));
        assert!(!subprotocol_accepted(&headers, "binary"));
        assert!(!subprotocol_accepted(&[], "xpra"));
    }

    #[tokio::test]
    async fn test_close_on_accepted_stream_sends_close_packet() {
        let (write, mut reader, _mirror) = write_half(StreamState::Open);
        write.lock().await.close().await;
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FRAME_DATA);
        assert_eq!(&frame.payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&frame.payload[2..], b"closing");
        // Stream finished after the close packet.
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_before_acceptance_sends_terminal_status() {
        let (write, mut reader, _mirror) = write_half(StreamState::HeadersSent);
        write.lock().await.close().await;
        // No close packet: a never-accepted stream ends with a HEADERS
        // frame carrying the terminal status.
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, h3::FRAME_HEADERS);
        let headers = h3::decode_headers(&frame.payload).unwrap();
        assert_eq!(header_value(&headers, ":status"), Some("1000"));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_before_any_headers_sends_terminal_status() {
        let (write, mut reader, _mirror) = write_half(StreamState::Requested);
        write.lock().await.close().await;
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, h3::FRAME_HEADERS);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_stream_is_ignored() {
        let map = StreamMap::new();
        // Must not panic or error.
        map.dispatch(99, StreamEvent::Data(Bytes::from_static(b"late")))
            .await;
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_stream_id() {
        let map = StreamMap::new();
        let (tx, mut rx) = mpsc::channel(4);
        map.insert(7, tx).await;
        map.dispatch(7, StreamEvent::Data(Bytes::from_static(b"hi")))
            .await;
        assert!(matches!(rx.recv().await, Some(StreamEvent::Data(d)) if &d[..] == b"hi"));
        map.remove(7).await;
        // After removal the id is unknown again.
        map.dispatch(7, StreamEvent::End).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quic_connection_reads_dispatched_data() {
        let (io, _peer) = tokio::io::duplex(4096);
        let map = StreamMap::new();
        let (tx, rx) = mpsc::channel(4);
        map.insert(4, tx.clone()).await;
        let state = Arc::new(AtomicU8::new(0));
        let write = Arc::new(Mutex::new(WriteHalf::new(
            io,
            StreamState::Open,
            state.clone(),
        )));
        let mut conn =
            QuicWsConnection::new(4, Endpoint::new("127.0.0.1", 14510), write, rx, map, state);

        tx.send(StreamEvent::Data(Bytes::from_static(b"abcdef")))
            .await
            .unwrap();
        assert_eq!(&conn.read(4).await.unwrap()[..], b"abcd");
        assert_eq!(&conn.read(4).await.unwrap()[..], b"ef");

        tx.send(StreamEvent::End).await.unwrap();
        assert_eq!(conn.read(4).await.unwrap().len(), 0);
        assert!(conn.is_closed());
        assert_eq!(conn.info().bytes_read, 6);
        assert_eq!(conn.info().extra["state"], "open");
    }

    #[tokio::test]
    async fn test_quic_connection_surfaces_rejection() {
        let (io, _peer) = tokio::io::duplex(4096);
        let map = StreamMap::new();
        let (tx, rx) = mpsc::channel(4);
        let state = Arc::new(AtomicU8::new(0));
        let write = Arc::new(Mutex::new(WriteHalf::new(
            io,
            StreamState::HeadersSent,
            state.clone(),
        )));
        let mut conn =
            QuicWsConnection::new(8, Endpoint::new("127.0.0.1", 14510), write, rx, map, state);

        tx.send(StreamEvent::Rejected(RejectReason::UnsupportedSubprotocol))
            .await
            .unwrap();
        assert!(matches!(
            conn.read(16).await,
            Err(ConnectionError::UnsupportedSubprotocol)
        ));
        // The rejection is sticky.
        assert!(matches!(
            conn.read(16).await,
            Err(ConnectionError::UnsupportedSubprotocol)
        ));
    }

    #[tokio::test]
    async fn test_pump_routes_data_and_end() {
        let (mut tx_io, rx_io) = tokio::io::duplex(4096);
        let map = StreamMap::new();
        let (tx, mut rx) = mpsc::channel(8);
        map.insert(2, tx).await;

        let pump = tokio::spawn(pump_stream(map.clone(), 2, FrameReader::new(rx_io)));
        tx_io
            .write_all(&h3::encode_frame(FRAME_DATA, b"payload"))
            .await
            .unwrap();
        drop(tx_io);
        pump.await.unwrap();

        assert!(matches!(rx.recv().await, Some(StreamEvent::Data(d)) if &d[..] == b"payload"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End)));
    }
}
