//! Minimal HTTP/3 framing for the QUIC multiplexer.
//!
//! Both ends of the tunnel speak this dialect, so only the pieces the
//! extended-CONNECT upgrade needs are implemented:
//!
//! - RFC 9000 variable-length integers;
//! - `DATA`, `HEADERS`, and `SETTINGS` frames;
//! - QPACK without a dynamic table: the encoder emits every field as a
//!   literal with a literal name, the decoder additionally understands
//!   static-table references.  Huffman coding is not used.
//!
//! Frame parsing is incremental so a frame spanning several QUIC packets is
//! reassembled transparently.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_SETTINGS: u64 = 0x04;

/// Unidirectional stream type identifiers.
pub const STREAM_CONTROL: u64 = 0x00;
pub const STREAM_QPACK_ENCODER: u64 = 0x02;
pub const STREAM_QPACK_DECODER: u64 = 0x03;

pub const SETTING_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTING_QPACK_BLOCKED_STREAMS: u64 = 0x07;
/// RFC 9220: the server must advertise this for extended CONNECT.
pub const SETTING_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;

/// Largest value a varint can carry (2^62 - 1).
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Frames larger than this are a protocol violation for our purposes.
const MAX_FRAME_PAYLOAD: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum H3Error {
    #[error("truncated frame")]
    Truncated,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("qpack: {0}")]
    Qpack(String),

    #[error("qpack: huffman coding not supported")]
    HuffmanUnsupported,

    #[error("stream error: {0}")]
    Stream(String),
}

// ── Varints ───────────────────────────────────────────────────────────────────

/// Appends an RFC 9000 variable-length integer.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    debug_assert!(value <= VARINT_MAX);
    if value < 1 << 6 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        out.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes());
    }
}

/// Decodes a varint, returning the value and the bytes consumed.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), H3Error> {
    let first = *data.first().ok_or(H3Error::Truncated)?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(H3Error::Truncated);
    }
    let mut value = (first & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One HTTP/3 frame: type varint, length varint, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u64,
    pub payload: Bytes,
}

/// Serializes a frame.
pub fn encode_frame(frame_type: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    encode_varint(frame_type, &mut out);
    encode_varint(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Serializes a SETTINGS frame from identifier/value pairs.
pub fn encode_settings(settings: &[(u64, u64)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (id, value) in settings {
        encode_varint(*id, &mut payload);
        encode_varint(*value, &mut payload);
    }
    encode_frame(FRAME_SETTINGS, &payload)
}

/// Parses a SETTINGS payload into identifier/value pairs.
pub fn decode_settings(mut payload: &[u8]) -> Result<Vec<(u64, u64)>, H3Error> {
    let mut settings = Vec::new();
    while !payload.is_empty() {
        let (id, n) = decode_varint(payload)?;
        payload = &payload[n..];
        let (value, n) = decode_varint(payload)?;
        payload = &payload[n..];
        settings.push((id, value));
    }
    Ok(settings)
}

/// Writes one frame to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame_type: u64,
    payload: &[u8],
) -> Result<(), H3Error> {
    let encoded = encode_frame(frame_type, payload);
    stream
        .write_all(&encoded)
        .await
        .map_err(|e| H3Error::Stream(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| H3Error::Stream(e.to_string()))
}

/// Incremental frame parser over any byte stream.
pub struct FrameReader<R> {
    stream: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Reads the next complete frame; `None` means a clean end of stream on
    /// a frame boundary.
    pub async fn next(&mut self) -> Result<Option<Frame>, H3Error> {
        loop {
            if let Some(frame) = self.parse_buffered()? {
                return Ok(Some(frame));
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| H3Error::Stream(e.to_string()))?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(H3Error::Truncated);
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Frame>, H3Error> {
        let data = &self.buf[..];
        let Ok((frame_type, n1)) = decode_varint(data) else {
            return Ok(None);
        };
        let Ok((len, n2)) = decode_varint(&data[n1..]) else {
            return Ok(None);
        };
        if len > MAX_FRAME_PAYLOAD {
            return Err(H3Error::Malformed(format!("frame of {len} bytes")));
        }
        let total = n1 + n2 + len as usize;
        if data.len() < total {
            return Ok(None);
        }
        self.buf.advance(n1 + n2);
        let payload = self.buf.split_to(len as usize).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

// ── QPACK ─────────────────────────────────────────────────────────────────────

/// Encodes an HPACK/QPACK prefix integer (RFC 7541 section 5.1).
fn encode_prefix_int(value: usize, prefix_bits: u8, first_byte: u8, out: &mut Vec<u8>) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        out.push(first_byte | value as u8);
        return;
    }
    out.push(first_byte | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        out.push((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    out.push(rest as u8);
}

fn decode_prefix_int(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), H3Error> {
    let first = *data.first().ok_or(H3Error::Truncated)?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = (first as usize) & max;
    if value < max {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, byte) in data[1..].iter().enumerate() {
        value += ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
        if shift > 28 {
            return Err(H3Error::Qpack("integer overflow".to_string()));
        }
    }
    Err(H3Error::Truncated)
}

/// Encodes a field section: zero required-insert-count prefix, every field a
/// literal with a literal name.  Never references any table, never huffman.
pub fn encode_headers(headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    // Required Insert Count = 0, Delta Base = 0: no dynamic table.
    out.push(0x00);
    out.push(0x00);
    for (name, value) in headers {
        // Literal Field Line With Literal Name: 001 N=0 H=0 namelen(3+).
        encode_prefix_int(name.len(), 3, 0b0010_0000, &mut out);
        out.extend_from_slice(name.as_bytes());
        // Value: H=0 len(7+).
        encode_prefix_int(value.len(), 7, 0x00, &mut out);
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Decodes a field section produced by a dynamic-table-free encoder.
pub fn decode_headers(data: &[u8]) -> Result<Vec<(String, String)>, H3Error> {
    // Field section prefix.
    let (required_insert_count, n1) = decode_prefix_int(data, 8)?;
    if required_insert_count != 0 {
        return Err(H3Error::Qpack("dynamic table not supported".to_string()));
    }
    let (_delta_base, n2) = decode_prefix_int(&data[n1..], 7)?;
    let mut data = &data[n1 + n2..];

    let mut headers = Vec::new();
    while !data.is_empty() {
        let first = data[0];
        if first & 0x80 != 0 {
            // Indexed Field Line: 1 T index(6+).
            if first & 0x40 == 0 {
                return Err(H3Error::Qpack("dynamic table reference".to_string()));
            }
            let (index, n) = decode_prefix_int(data, 6)?;
            data = &data[n..];
            let (name, value) = static_entry(index as u64)?;
            headers.push((name.to_string(), value.to_string()));
        } else if first & 0x40 != 0 {
            // Literal Field Line With Name Reference: 01 N T index(4+).
            if first & 0x10 == 0 {
                return Err(H3Error::Qpack("dynamic table reference".to_string()));
            }
            let (index, n) = decode_prefix_int(data, 4)?;
            data = &data[n..];
            let (name, _) = static_entry(index as u64)?;
            let (value, n) = decode_string(data, 7)?;
            data = &data[n..];
            headers.push((name.to_string(), value));
        } else if first & 0x20 != 0 {
            // Literal Field Line With Literal Name: 001 N H namelen(3+).
            if first & 0x08 != 0 {
                return Err(H3Error::HuffmanUnsupported);
            }
            let (name_len, n) = decode_prefix_int(data, 3)?;
            data = &data[n..];
            if data.len() < name_len {
                return Err(H3Error::Truncated);
            }
            let name = String::from_utf8(data[..name_len].to_vec())
                .map_err(|_| H3Error::Qpack("field name is not utf-8".to_string()))?;
            data = &data[name_len..];
            let (value, n) = decode_string(data, 7)?;
            data = &data[n..];
            headers.push((name, value));
        } else {
            return Err(H3Error::Qpack(format!(
                "unsupported field line prefix {first:#04x}"
            )));
        }
    }
    Ok(headers)
}

/// Decodes a length-prefixed string with a huffman bit ahead of the length.
fn decode_string(data: &[u8], prefix_bits: u8) -> Result<(String, usize), H3Error> {
    let first = *data.first().ok_or(H3Error::Truncated)?;
    if first & (1 << prefix_bits) != 0 {
        return Err(H3Error::HuffmanUnsupported);
    }
    let (len, n) = decode_prefix_int(data, prefix_bits)?;
    if data.len() < n + len {
        return Err(H3Error::Truncated);
    }
    let value = String::from_utf8(data[n..n + len].to_vec())
        .map_err(|_| H3Error::Qpack("field value is not utf-8".to_string()))?;
    Ok((value, n + len))
}

/// The head of the QPACK static table (RFC 9204 Appendix A): enough for
/// every pseudo-header a conforming peer could reference.
fn static_entry(index: u64) -> Result<(&'static str, &'static str), H3Error> {
    Ok(match index {
        0 => (":authority", ""),
        1 => (":path", "/"),
        2 => ("age", "0"),
        3 => ("content-disposition", ""),
        4 => ("content-length", "0"),
        5 => ("cookie", ""),
        6 => ("date", ""),
        7 => ("etag", ""),
        8 => ("if-modified-since", ""),
        9 => ("if-none-match", ""),
        10 => ("last-modified", ""),
        11 => ("link", ""),
        12 => ("location", ""),
        13 => ("referer", ""),
        14 => ("set-cookie", ""),
        15 => (":method", "CONNECT"),
        16 => (":method", "DELETE"),
        17 => (":method", "GET"),
        18 => (":method", "HEAD"),
        19 => (":method", "OPTIONS"),
        20 => (":method", "POST"),
        21 => (":method", "PUT"),
        22 => (":scheme", "http"),
        23 => (":scheme", "https"),
        24 => (":status", "103"),
        25 => (":status", "200"),
        26 => (":status", "304"),
        27 => (":status", "404"),
        28 => (":status", "503"),
        other => {
            return Err(H3Error::Qpack(format!(
                "static table index {other} not supported"
            )))
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encodes_each_width() {
        for (value, expected) in [
            (0u64, vec![0x00]),
            (63, vec![0x3f]),
            (64, vec![0x40, 0x40]),
            (16383, vec![0x7f, 0xff]),
            (16384, vec![0x80, 0x00, 0x40, 0x00]),
            (1 << 30, vec![0xc0, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00]),
        ] {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out, expected, "value {value}");
            let (decoded, n) = decode_varint(&out).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(n, out.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(matches!(decode_varint(&[]), Err(H3Error::Truncated)));
        assert!(matches!(decode_varint(&[0x40]), Err(H3Error::Truncated)));
    }

    #[test]
    fn test_prefix_int_round_trip() {
        for value in [0usize, 6, 7, 8, 127, 128, 300, 10_000] {
            let mut out = Vec::new();
            encode_prefix_int(value, 3, 0b0010_0000, &mut out);
            let (decoded, n) = decode_prefix_int(&out, 3).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(n, out.len());
        }
    }

    #[test]
    fn test_headers_round_trip() {
        let headers = vec![
            (":method".to_string(), "CONNECT".to_string()),
            (":protocol".to_string(), "websocket".to_string()),
            ("sec-websocket-protocol".to_string(), "xpra".to_string()),
        ];
        let encoded = encode_headers(&headers);
        assert_eq!(decode_headers(&encoded).unwrap(), headers);
    }

    #[test]
    fn test_decode_indexed_static_field() {
        // Prefix, then indexed field line for :method CONNECT (index 15).
        let data = [0x00, 0x00, 0x80 | 0x40 | 15];
        let headers = decode_headers(&data).unwrap();
        assert_eq!(headers, vec![(":method".to_string(), "CONNECT".to_string())]);
    }

    #[test]
    fn test_decode_static_name_reference() {
        // :path (static 1) with literal value "/chat".
        let mut data = vec![0x00, 0x00, 0x40 | 0x10 | 1];
        data.push(5);
        data.extend_from_slice(b"/chat");
        let headers = decode_headers(&data).unwrap();
        assert_eq!(headers, vec![(":path".to_string(), "/chat".to_string())]);
    }

    #[test]
    fn test_decode_rejects_huffman() {
        // Literal name with the huffman bit set.
        let data = [0x00, 0x00, 0b0010_1000 | 1, b'x', 0x00];
        assert!(matches!(
            decode_headers(&data),
            Err(H3Error::HuffmanUnsupported)
        ));
    }

    #[test]
    fn test_decode_rejects_dynamic_table() {
        // Non-zero required insert count.
        assert!(matches!(
            decode_headers(&[0x05, 0x00]),
            Err(H3Error::Qpack(_))
        ));
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = vec![
            (SETTING_QPACK_MAX_TABLE_CAPACITY, 0),
            (SETTING_ENABLE_CONNECT_PROTOCOL, 1),
        ];
        let frame = encode_settings(&settings);
        let (frame_type, n1) = decode_varint(&frame).unwrap();
        assert_eq!(frame_type, FRAME_SETTINGS);
        let (len, n2) = decode_varint(&frame[n1..]).unwrap();
        let payload = &frame[n1 + n2..n1 + n2 + len as usize];
        assert_eq!(decode_settings(payload).unwrap(), settings);
    }

    #[tokio::test]
    async fn test_frame_reader_reassembles_split_frames() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let frame = encode_frame(FRAME_DATA, b"hello multiplexer");
        let writer = tokio::spawn(async move {
            // Dribble the frame a few bytes at a time.
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
            }
            drop(tx);
        });
        let mut reader = FrameReader::new(rx);
        let got = reader.next().await.unwrap().unwrap();
        assert_eq!(got.frame_type, FRAME_DATA);
        assert_eq!(&got.payload[..], b"hello multiplexer");
        assert!(reader.next().await.unwrap().is_none());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_frame_reader_mid_frame_eof_is_an_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&encode_frame(FRAME_DATA, b"full")[..3])
            .await
            .unwrap();
        drop(tx);
        let mut reader = FrameReader::new(rx);
        assert!(matches!(reader.next().await, Err(H3Error::Truncated)));
    }
}
