//! Lantern wire format — on-wire types for device-link communication.
//!
//! These types ARE the protocol the firmware speaks. Every field, every size
//! is part of the wire format; changing anything here is a breaking change
//! against already-flashed controllers.
//!
//! All types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// The unit of transmission on chunked byte transports (BLE, serial).
///
/// Every binary payload is preceded by this header. The receiver can verify
/// the header and the payload independently before acting on either: a frame
/// is valid only when both CRC checks pass.
///
/// Wire size: 20 bytes, little-endian u32 fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Frame type code — one of the FRAME_* constants below.
    pub frame_type: u32,

    /// Length of the payload in bytes, not including this header.
    pub payload_size: u32,

    /// How long the receiver may take to produce a response, in milliseconds.
    /// Zero for frames that expect no response.
    pub receive_timeout_ms: u32,

    /// CRC32 of the payload bytes that follow the header.
    pub payload_crc: u32,

    /// CRC32 of the first 16 bytes of this header.
    /// Guards against acting on a corrupted length or type field.
    pub header_crc: u32,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 20]);

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 20;

// ── Frame type codes ──────────────────────────────────────────────────────────

/// Fire-and-forget byte-code for the controller engine.
pub const FRAME_EXECUTE: u32 = 0x01;
/// Byte-code that expects a response payload.
pub const FRAME_REQUEST: u32 = 0x02;
/// A serialized [`SyncRecord`].
pub const FRAME_SYNC: u32 = 0x03;
/// Clock read/write exchange.
pub const FRAME_CLOCK: u32 = 0x04;
/// Firmware update data.
pub const FRAME_OTA: u32 = 0x05;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default atomic write limit for chunked transports.
/// Payloads larger than this are split into back-to-back chunks; chunk
/// boundaries carry no protocol meaning beyond the transport MTU.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Notification chunks of exactly this many bytes mean "more chunks follow".
/// Any other length terminates reassembly of the current message.
pub const CONTINUE_CHUNK_SIZE: usize = 208;

/// Maximum payload size a single frame may declare.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Compute the CRC32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a frame: header (with both CRCs filled in) followed by the payload.
pub fn encode_frame(
    frame_type: u32,
    receive_timeout_ms: u32,
    payload: &[u8],
) -> Result<BytesMut, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut header = FrameHeader {
        frame_type,
        payload_size: payload.len() as u32,
        receive_timeout_ms,
        payload_crc: crc32(payload),
        header_crc: 0,
    };
    header.header_crc = crc32(&header.as_bytes()[..16]);

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    Ok(buf)
}

/// Decode a complete frame from a buffer.
///
/// Returns `Ok(None)` if the buffer does not yet hold the full frame.
/// A CRC mismatch in either the header or the payload is an error — the
/// frame must not be acted on partially.
pub fn decode_frame(src: &[u8]) -> Result<Option<(FrameHeader, Bytes)>, WireError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::read_from_prefix(&src[..HEADER_SIZE])
        .ok_or(WireError::TruncatedHeader)?;

    if crc32(&src[..16]) != { header.header_crc } {
        return Err(WireError::HeaderCrcMismatch);
    }

    let payload_size = { header.payload_size } as usize;
    if payload_size > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload_size));
    }
    if src.len() < HEADER_SIZE + payload_size {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&src[HEADER_SIZE..HEADER_SIZE + payload_size]);
    if crc32(&payload) != { header.payload_crc } {
        return Err(WireError::PayloadCrcMismatch);
    }

    Ok(Some((header, payload)))
}

// ── Hop messages ──────────────────────────────────────────────────────────────

/// First body byte of a request frame traveling outward along a path.
pub const HOP_REQUEST: u8 = 0x01;
/// First body byte of a response frame traveling back to the originator.
pub const HOP_RESPONSE: u8 = 0x02;

/// Encode a multi-hop request body:
/// `0x01 | ticket(u32 LE) | hop_count(u8) | address(u32 LE) × count | payload`.
pub fn encode_hop_request(ticket: u32, path: &[u32], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + path.len() * 4 + payload.len());
    buf.put_u8(HOP_REQUEST);
    buf.put_u32_le(ticket);
    buf.put_u8(path.len() as u8);
    for address in path {
        buf.put_u32_le(*address);
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a multi-hop request body. Returns the ticket, the hop addresses
/// and the payload, or `None` when the body is not a well-formed request.
pub fn decode_hop_request(body: &Bytes) -> Option<(u32, Vec<u32>, Bytes)> {
    if body.len() < 6 || body[0] != HOP_REQUEST {
        return None;
    }
    let ticket = u32::from_le_bytes(body[1..5].try_into().ok()?);
    let count = body[5] as usize;
    let end = 6 + count * 4;
    if body.len() < end {
        return None;
    }
    let path = body[6..end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some((ticket, path, body.slice(end..)))
}

/// Encode a multi-hop response body: `0x02 | ticket(u32 LE) | code(u8) |
/// payload`. Code zero is success.
pub fn encode_hop_response(ticket: u32, code: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u8(HOP_RESPONSE);
    buf.put_u32_le(ticket);
    buf.put_u8(code);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode a multi-hop response body arriving as a notification.
pub fn decode_hop_response(body: &Bytes) -> Option<(u32, u8, Bytes)> {
    if body.len() < 6 || body[0] != HOP_RESPONSE {
        return None;
    }
    let ticket = u32::from_le_bytes(body[1..5].try_into().ok()?);
    Some((ticket, body[5], body.slice(6..)))
}

// ── Synchronization Record ────────────────────────────────────────────────────

/// Reconciles two devices' views of time and content fingerprints.
///
/// Exchanged on connect and pushed unsolicited on timeline manipulation.
/// Must round-trip byte-identically across any transport.
///
/// Wire size: 44 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SyncRecord {
    /// Fingerprint of the sender's event history.
    pub history_fingerprint: u32,

    /// Fingerprint of the byte-code currently loaded on the sender.
    pub tngl_fingerprint: u32,

    /// The sender's logical clock at serialization time, in milliseconds.
    pub clock_timestamp: u64,

    /// Logical clock value at the last timeline manipulation.
    pub timeline_clock_timestamp: u64,

    /// Logical clock value when the current byte-code was written.
    pub tngl_clock_timestamp: u64,

    /// Firmware compilation timestamp of the sender.
    pub fw_compilation_timestamp: u64,

    /// Network address of the originating controller.
    pub origin_address: u32,
}

assert_eq_size!(SyncRecord, [u8; 44]);

/// Synchronization record size in bytes.
pub const SYNC_RECORD_SIZE: usize = 44;

impl SyncRecord {
    /// Deserialize from a transport payload. Rejects short input.
    pub fn read(src: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(src).ok_or(WireError::TruncatedSyncRecord(src.len()))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame header truncated")]
    TruncatedHeader,

    #[error("frame header CRC mismatch")]
    HeaderCrcMismatch,

    #[error("frame payload CRC mismatch")]
    PayloadCrcMismatch,

    #[error("payload length {0} exceeds maximum")]
    PayloadTooLarge(usize),

    #[error("synchronization record truncated: {0} bytes")]
    TruncatedSyncRecord(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
