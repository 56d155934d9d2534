// src/core/protocol/resp_frame.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder` for network communication. Both RESP2
//! and the RESP3 extensions negotiated through `HELLO 3` are understood.

use crate::core::ClientError;
use crate::core::protocol::command::Command;
use bytes::{Buf, Bytes, BytesMut};
use std::borrow::Cow;
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits that guard against a misbehaving server.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024; // Max elements in an aggregate.
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024; // 512MB max bulk string size.
const MAX_RECURSION_DEPTH: usize = 256; // Limit recursion to prevent stack overflow.

/// An enum representing a single decoded reply in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
    // --- RESP3 ---
    Double(f64),
    Boolean(bool),
    /// Arbitrary precision integers are kept in their textual form.
    BigNumber(String),
    Map(Vec<(RespFrame, RespFrame)>),
    /// Out-of-band data (pub/sub messages, invalidations) pushed by the server.
    Push(Vec<RespFrame>),
}

impl RespFrame {
    /// A convenience method to encode a frame into a `Vec<u8>`.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, ClientError> {
        let mut buf = BytesMut::new();
        RespFrameCodec::default().encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespFrame::Null | RespFrame::NullArray)
    }

    /// Returns the raw bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespFrame::BulkString(b) => Some(b),
            RespFrame::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the text of a bulk or simple string, decoding bulk payloads as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespFrame::BulkString(b) => std::str::from_utf8(b).ok(),
            RespFrame::SimpleString(s) => Some(s),
            _ => None,
        }
    }

    /// Lossy text view used for logging and error messages.
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            RespFrame::BulkString(b) => String::from_utf8_lossy(b),
            RespFrame::SimpleString(s) | RespFrame::Error(s) | RespFrame::BigNumber(s) => {
                Cow::Borrowed(s)
            }
            other => Cow::Owned(format!("{other:?}")),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespFrame::Integer(i) => Some(*i),
            RespFrame::BulkString(_) | RespFrame::SimpleString(_) | RespFrame::BigNumber(_) => {
                self.to_text_lossy().parse().ok()
            }
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|i| i32::try_from(i).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RespFrame::Integer(i) => u64::try_from(*i).ok(),
            RespFrame::BulkString(_) | RespFrame::SimpleString(_) | RespFrame::BigNumber(_) => {
                self.to_text_lossy().parse().ok()
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RespFrame::Double(d) => Some(*d),
            RespFrame::Integer(i) => Some(*i as f64),
            RespFrame::BulkString(_) | RespFrame::SimpleString(_) => {
                self.to_text_lossy().parse().ok()
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RespFrame::Boolean(b) => Some(*b),
            RespFrame::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Returns the elements of any sequence-shaped frame (array or push).
    pub fn as_array(&self) -> Option<&[RespFrame]> {
        match self {
            RespFrame::Array(items) | RespFrame::Push(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespFrame>> {
        match self {
            RespFrame::Array(items) | RespFrame::Push(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true for a `+OK` style acknowledgement.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespFrame::SimpleString(s) if s.eq_ignore_ascii_case("OK"))
    }

    /// Converts a server error reply into `Err(ClientError::Server)`.
    pub fn into_result(self) -> Result<RespFrame, ClientError> {
        match self {
            RespFrame::Error(message) => Err(ClientError::Server(message)),
            other => Ok(other),
        }
    }
}

impl From<&str> for RespFrame {
    fn from(s: &str) -> Self {
        RespFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for RespFrame {
    fn from(b: Bytes) -> Self {
        RespFrame::BulkString(b)
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
///
/// Commands are encoded through `Encoder<&Command>`, which applies the
/// configured key prefix to key arguments while writing.
#[derive(Debug, Clone, Default)]
pub struct RespFrameCodec {
    key_prefix: Option<Bytes>,
}

impl RespFrameCodec {
    pub fn with_key_prefix(prefix: Option<Bytes>) -> Self {
        Self {
            key_prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    pub fn key_prefix(&self) -> Option<&[u8]> {
        self.key_prefix.as_deref()
    }
}

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = ClientError;

    /// Encodes a `RespFrame` into a `BytesMut` buffer according to the RESP specification.
    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(itoa::Buffer::new().format(i).as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                write_length(dst, b'$', b.len());
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::NullArray => {
                dst.extend_from_slice(b"*-1\r\n");
            }
            RespFrame::Array(arr) => {
                write_length(dst, b'*', arr.len());
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
            RespFrame::Double(d) => {
                dst.extend_from_slice(b",");
                if d.is_infinite() {
                    dst.extend_from_slice(if d > 0.0 { b"inf" } else { b"-inf" });
                } else if d.is_nan() {
                    dst.extend_from_slice(b"nan");
                } else {
                    dst.extend_from_slice(ryu::Buffer::new().format(d).as_bytes());
                }
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Boolean(b) => {
                dst.extend_from_slice(if b { b"#t\r\n" } else { b"#f\r\n" });
            }
            RespFrame::BigNumber(n) => {
                dst.extend_from_slice(b"(");
                dst.extend_from_slice(n.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Map(pairs) => {
                write_length(dst, b'%', pairs.len());
                for (k, v) in pairs {
                    self.encode(k, dst)?;
                    self.encode(v, dst)?;
                }
            }
            RespFrame::Push(items) => {
                write_length(dst, b'>', items.len());
                for frame in items {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Encoder<&Command> for RespFrameCodec {
    type Error = ClientError;

    /// Writes a command as an array of bulk strings.
    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(self.key_prefix.as_deref(), dst);
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = ClientError;

    /// Decodes a `RespFrame` from a `BytesMut` buffer. Nothing is consumed unless
    /// a complete frame is available, so a caller can append more bytes and retry.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_frame(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            // If the error is `IncompleteData`, we return `Ok(None)` to signal that
            // we need more data. For any other error, we propagate it up.
            Err(ClientError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Decodes one value from `buf` without touching the caller's buffer. Returns the
/// frame and the number of bytes it occupied, or `IncompleteData`.
pub fn decode_slice(buf: &[u8]) -> Result<(RespFrame, usize), ClientError> {
    let mut bytes = buf;
    let frame = decode_frame(&mut bytes, 0)?;
    Ok((frame, buf.len() - bytes.len()))
}

/// A recursive helper function to decode a `RespFrame`.
/// The `bytes` parameter is a mutable slice that is advanced as it's parsed.
fn decode_frame(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, ClientError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(ClientError::Protocol(
            "RESP recursion depth limit exceeded".to_string(),
        ));
    }

    if bytes.is_empty() {
        return Err(ClientError::IncompleteData);
    }

    let type_byte = bytes[0];
    // Advance past the type prefix.
    *bytes = &bytes[1..];
    match type_byte {
        b'+' => Ok(RespFrame::SimpleString(lossy(parse_line(bytes)?))),
        b'-' => Ok(RespFrame::Error(lossy(parse_line(bytes)?))),
        b':' => Ok(RespFrame::Integer(parse_number(parse_line(bytes)?)?)),
        b'$' => match parse_blob(bytes)? {
            Some(data) => Ok(RespFrame::BulkString(data)),
            None => Ok(RespFrame::Null),
        },
        b'*' => match parse_aggregate_len(bytes)? {
            Some(len) => Ok(RespFrame::Array(parse_elements(bytes, len, depth)?)),
            None => Ok(RespFrame::NullArray),
        },
        b'_' => {
            parse_line(bytes)?;
            Ok(RespFrame::Null)
        }
        b'#' => match parse_line(bytes)? {
            b"t" => Ok(RespFrame::Boolean(true)),
            b"f" => Ok(RespFrame::Boolean(false)),
            other => Err(ClientError::Protocol(format!(
                "invalid boolean '{}'",
                String::from_utf8_lossy(other)
            ))),
        },
        b',' => {
            let line = std::str::from_utf8(parse_line(bytes)?)?;
            Ok(RespFrame::Double(line.parse::<f64>()?))
        }
        b'(' => Ok(RespFrame::BigNumber(lossy(parse_line(bytes)?))),
        b'!' => match parse_blob(bytes)? {
            Some(data) => Ok(RespFrame::Error(String::from_utf8_lossy(&data).into_owned())),
            None => Ok(RespFrame::Null),
        },
        b'=' => match parse_blob(bytes)? {
            // Verbatim strings carry a three byte format tag and a colon ("txt:").
            Some(data) if data.len() >= 4 && data[3] == b':' => {
                Ok(RespFrame::BulkString(data.slice(4..)))
            }
            Some(data) => Ok(RespFrame::BulkString(data)),
            None => Ok(RespFrame::Null),
        },
        b'~' => match parse_aggregate_len(bytes)? {
            Some(len) => Ok(RespFrame::Array(parse_elements(bytes, len, depth)?)),
            None => Ok(RespFrame::NullArray),
        },
        b'>' => match parse_aggregate_len(bytes)? {
            Some(len) => Ok(RespFrame::Push(parse_elements(bytes, len, depth)?)),
            None => Ok(RespFrame::NullArray),
        },
        b'%' => match parse_aggregate_len(bytes)? {
            Some(len) => {
                let mut pairs = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = decode_frame(bytes, depth + 1)?;
                    let value = decode_frame(bytes, depth + 1)?;
                    pairs.push((key, value));
                }
                Ok(RespFrame::Map(pairs))
            }
            None => Ok(RespFrame::Null),
        },
        b'|' => {
            // Attributes are auxiliary metadata preceding the real reply; skip them.
            let len = parse_aggregate_len(bytes)?.unwrap_or(0);
            for _ in 0..len * 2 {
                decode_frame(bytes, depth + 1)?;
            }
            decode_frame(bytes, depth + 1)
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected type byte '{}'",
            other.escape_ascii()
        ))),
    }
}

/// Finds the next CRLF and returns the line, advancing past the terminator.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], ClientError> {
    if let Some(pos) = find_crlf(bytes) {
        let line = &bytes[..pos];
        // Advance the buffer past the line and CRLF.
        *bytes = &bytes[pos + CRLF_LEN..];
        Ok(line)
    } else {
        Err(ClientError::IncompleteData)
    }
}

fn parse_number(line: &[u8]) -> Result<i64, ClientError> {
    let s = std::str::from_utf8(line)?;
    Ok(s.parse::<i64>()?)
}

/// Parses a length-prefixed payload (`$`, `!`, `=`). `None` means a null blob.
fn parse_blob(bytes: &mut &[u8]) -> Result<Option<Bytes>, ClientError> {
    let len = parse_number(parse_line(bytes)?)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 || len as usize > MAX_BULK_STRING_SIZE {
        return Err(ClientError::Protocol(format!("invalid bulk length {len}")));
    }

    let len = len as usize;
    if bytes.len() < len + CRLF_LEN {
        return Err(ClientError::IncompleteData);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return Err(ClientError::Protocol(
            "bulk string is not terminated by CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&bytes[..len]);
    // Advance the buffer past the data and the final CRLF.
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(Some(data))
}

/// Parses the element count of an aggregate. `None` means a null aggregate.
fn parse_aggregate_len(bytes: &mut &[u8]) -> Result<Option<usize>, ClientError> {
    let len = parse_number(parse_line(bytes)?)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 || len as usize > MAX_FRAME_ELEMENTS {
        return Err(ClientError::Protocol(format!(
            "invalid aggregate length {len}"
        )));
    }
    Ok(Some(len as usize))
}

fn parse_elements(
    bytes: &mut &[u8],
    len: usize,
    depth: usize,
) -> Result<Vec<RespFrame>, ClientError> {
    // Cap the pre-allocation; the declared length is untrusted until parsed.
    let mut frames = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        frames.push(decode_frame(bytes, depth + 1)?);
    }
    Ok(frames)
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn write_length(dst: &mut BytesMut, prefix: u8, len: usize) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(itoa::Buffer::new().format(len).as_bytes());
    dst.extend_from_slice(CRLF);
}

/// Helper function to find the next CRLF sequence in a buffer.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
