//! AWS event-stream binary framing.
//!
//! Frame layout, big-endian throughout:
//!
//! ```text
//! [total_len:4][headers_len:4][prelude_crc:4][headers...][payload...][message_crc:4]
//! ```
//!
//! Both CRCs are CRC-32C (Castagnoli). The prelude CRC covers the first
//! eight bytes; the message CRC covers everything before itself. A frame
//! failing either CRC is skipped and the decoder resynchronizes on the
//! next valid prelude; a frame whose declared length can never be
//! satisfied aborts the stream.

mod sse;

pub use sse::{sse_response_headers, EventStreamToSse};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

pub const EVENT_TYPE_HEADER: &str = ":event-type";
pub const EXCEPTION_TYPE_HEADER: &str = ":exception-type";

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = 16;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_TYPE_BOOL_TRUE: u8 = 0;
const HEADER_TYPE_BOOL_FALSE: u8 = 1;
const HEADER_TYPE_BYTE: u8 = 2;
const HEADER_TYPE_SHORT: u8 = 3;
const HEADER_TYPE_INT: u8 = 4;
const HEADER_TYPE_LONG: u8 = 5;
const HEADER_TYPE_BYTES: u8 = 6;
const HEADER_TYPE_STRING: u8 = 7;
const HEADER_TYPE_TIMESTAMP: u8 = 8;
const HEADER_TYPE_UUID: u8 = 9;

/// A decoded event-stream message: string headers plus the raw payload.
/// Non-string header values are length-skipped during decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Vec<(String, String)>,
    payload: Bytes,
}

impl Message {
    pub fn new(headers: Vec<(String, String)>, payload: Bytes) -> Self {
        Self { headers, payload }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(EVENT_TYPE_HEADER)
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header(EXCEPTION_TYPE_HEADER)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PreludeCrc,
    MessageCrc,
    BadHeader,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::PreludeCrc => f.write_str("prelude CRC mismatch"),
            SkipReason::MessageCrc => f.write_str("message CRC mismatch"),
            SkipReason::BadHeader => f.write_str("unknown header value type"),
        }
    }
}

/// Outcome of one decode attempt against the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes buffered for a verdict.
    Incomplete,
    /// A valid frame; `consumed` bytes belong to it.
    Frame { message: Message, consumed: usize },
    /// A corrupt frame; discard `consumed` bytes and try again.
    Skipped {
        consumed: usize,
        reason: SkipReason,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {total} exceeds maximum {MAX_FRAME_LEN}")]
    Oversize { total: usize },
    #[error("frame geometry invalid: total {total}, headers {headers}")]
    Geometry { total: usize, headers: usize },
    #[error("truncated frame: need {total} bytes, stream ended with {available}")]
    Truncated { total: usize, available: usize },
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Check the twelve bytes at the front of `buf` for a CRC-valid,
/// geometrically plausible prelude.
pub(crate) fn checked_prelude(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < PRELUDE_LEN {
        return None;
    }
    let declared = read_u32(&buf[8..12]);
    if crc32c::crc32c(&buf[..8]) != declared {
        return None;
    }
    let total = read_u32(&buf[0..4]) as usize;
    let headers_len = read_u32(&buf[4..8]) as usize;
    if total < MIN_FRAME_LEN || total > MAX_FRAME_LEN || headers_len > total - MIN_FRAME_LEN {
        return None;
    }
    Some((total, headers_len))
}

/// Decode one frame from the front of `buf`.
///
/// Corrupt frames are reported as `Skipped` rather than errors so a live
/// stream survives isolated damage; only a length the peer can never
/// satisfy is fatal.
pub fn parse_frame(buf: &[u8]) -> Result<ParseOutcome, FrameError> {
    if buf.len() < PRELUDE_LEN {
        return Ok(ParseOutcome::Incomplete);
    }

    let Some((total, headers_len)) = checked_prelude(buf) else {
        // The prelude is damaged, so its lengths cannot be trusted.
        // Resynchronize by scanning for the next verifiable prelude.
        let total = read_u32(&buf[0..4]) as usize;
        if crc32c::crc32c(&buf[..8]) == read_u32(&buf[8..12]) {
            // CRC passed but the geometry is impossible: the peer is
            // speaking a different protocol. Framing cannot recover.
            if total > MAX_FRAME_LEN {
                return Err(FrameError::Oversize { total });
            }
            return Err(FrameError::Geometry {
                total,
                headers: read_u32(&buf[4..8]) as usize,
            });
        }
        return Ok(ParseOutcome::Skipped {
            consumed: resync_offset(buf),
            reason: SkipReason::PreludeCrc,
        });
    };

    if buf.len() < total {
        return Ok(ParseOutcome::Incomplete);
    }

    let declared_message_crc = read_u32(&buf[total - 4..total]);
    if crc32c::crc32c(&buf[..total - 4]) != declared_message_crc {
        return Ok(ParseOutcome::Skipped {
            consumed: total,
            reason: SkipReason::MessageCrc,
        });
    }

    let headers_end = PRELUDE_LEN + headers_len;
    let Some(headers) = parse_headers(&buf[PRELUDE_LEN..headers_end]) else {
        return Ok(ParseOutcome::Skipped {
            consumed: total,
            reason: SkipReason::BadHeader,
        });
    };
    let payload = Bytes::copy_from_slice(&buf[headers_end..total - 4]);

    Ok(ParseOutcome::Frame {
        message: Message::new(headers, payload),
        consumed: total,
    })
}

/// How many bytes to discard after a prelude CRC failure: up to the next
/// offset that holds a verifiable prelude, or almost the whole buffer if
/// none is in sight (keeping a prelude's worth of tail for the next read).
fn resync_offset(buf: &[u8]) -> usize {
    for offset in 1..buf.len().saturating_sub(PRELUDE_LEN - 1) {
        if checked_prelude(&buf[offset..]).is_some() {
            return offset;
        }
    }
    buf.len().saturating_sub(PRELUDE_LEN - 1).max(1)
}

/// Walk the header section. Only string values are surfaced; every other
/// type is skipped by its fixed or length-prefixed width. Returns `None`
/// on an unknown type byte or a width overrunning the section.
fn parse_headers(mut buf: &[u8]) -> Option<Vec<(String, String)>> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let name_len = buf[0] as usize;
        buf = buf.get(1..)?;
        let name = std::str::from_utf8(buf.get(..name_len)?).ok()?;
        buf = &buf[name_len..];

        let value_type = *buf.first()?;
        buf = &buf[1..];

        match value_type {
            HEADER_TYPE_STRING => {
                let value_len = u16::from_be_bytes([*buf.first()?, *buf.get(1)?]) as usize;
                buf = &buf[2..];
                let value = std::str::from_utf8(buf.get(..value_len)?).ok()?;
                buf = &buf[value_len..];
                headers.push((name.to_string(), value.to_string()));
            }
            HEADER_TYPE_BOOL_TRUE | HEADER_TYPE_BOOL_FALSE => {}
            HEADER_TYPE_BYTE => buf = buf.get(1..)?,
            HEADER_TYPE_SHORT => buf = buf.get(2..)?,
            HEADER_TYPE_INT => buf = buf.get(4..)?,
            HEADER_TYPE_LONG | HEADER_TYPE_TIMESTAMP => buf = buf.get(8..)?,
            HEADER_TYPE_BYTES => {
                let value_len = u16::from_be_bytes([*buf.first()?, *buf.get(1)?]) as usize;
                buf = buf.get(2 + value_len..)?;
            }
            HEADER_TYPE_UUID => buf = buf.get(16..)?,
            _ => return None,
        }
    }
    Some(headers)
}

/// Encode a message with string headers into one wire frame.
pub fn build_message(headers: &[(&str, &str)], payload: &[u8]) -> Bytes {
    let mut header_buf = BytesMut::new();
    for (name, value) in headers {
        header_buf.put_u8(name.len() as u8);
        header_buf.put_slice(name.as_bytes());
        header_buf.put_u8(HEADER_TYPE_STRING);
        header_buf.put_u16(value.len() as u16);
        header_buf.put_slice(value.as_bytes());
    }

    let total = PRELUDE_LEN + header_buf.len() + payload.len() + 4;
    let mut frame = BytesMut::with_capacity(total);
    frame.put_u32(total as u32);
    frame.put_u32(header_buf.len() as u32);
    let prelude_crc = crc32c::crc32c(&frame[..8]);
    frame.put_u32(prelude_crc);
    frame.put_slice(&header_buf);
    frame.put_slice(payload);
    let message_crc = crc32c::crc32c(&frame[..]);
    frame.put_u32(message_crc);
    frame.freeze()
}
