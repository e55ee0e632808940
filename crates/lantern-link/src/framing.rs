//! Chunked frame transmission — write planning, bounded retry, and
//! notification reassembly.
//!
//! Physical channels here have an atomic write size smaller than typical
//! payloads. A frame (header + payload) is split into back-to-back chunks;
//! the receiver reassembles by byte count alone. Chunk boundaries carry no
//! protocol meaning beyond the transport MTU.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use lantern_core::config::LinkConfig;
use lantern_core::wire::{encode_frame, CONTINUE_CHUNK_SIZE};

use crate::connector::ConnectorError;

// ── Raw channel abstraction ───────────────────────────────────────────────────

/// The raw half-duplex byte channel under a chunked transport.
///
/// Implemented by transport backends and by test doubles. One chunk per
/// `write_chunk` call; the channel never splits or merges chunks itself.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Atomic write limit of this channel, in bytes.
    fn chunk_size(&self) -> usize;

    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), ConnectorError>;

    /// Await the next response message from the channel.
    async fn read_response(&self) -> Result<Bytes, ConnectorError>;
}

// ── Timeouts ──────────────────────────────────────────────────────────────────

/// Raise a caller-supplied timeout to the physical minimum for this write.
///
/// Slow links cannot move bytes faster than their clock allows; a caller
/// timeout below `len × per_byte + fixed_minimum` would fail every time.
pub fn write_timeout_floor(payload_len: usize, caller: Duration, config: &LinkConfig) -> Duration {
    let floor = Duration::from_micros(payload_len as u64 * config.per_byte_timeout_us)
        + Duration::from_millis(config.min_write_timeout_ms);
    caller.max(floor)
}

/// Number of chunks a payload of `len` bytes occupies at the given limit.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size)
    }
}

// ── Write path ────────────────────────────────────────────────────────────────

/// Encode and write one frame, retrying up to the configured try budget.
///
/// Each attempt writes every chunk back-to-back and is bounded by the raised
/// timeout. After the last failed try the write surfaces as `WriteFailed`.
/// An integrity rejection from the peer is indistinguishable from a lost
/// write here and consumes a try like any other failure.
pub async fn deliver_frame(
    channel: &dyn FrameChannel,
    frame_type: u32,
    receive_timeout_ms: u32,
    payload: &[u8],
    timeout: Duration,
    config: &LinkConfig,
) -> Result<(), ConnectorError> {
    let frame = encode_frame(frame_type, receive_timeout_ms, payload)
        .map_err(|_| ConnectorError::WriteFailed)?;
    let effective = write_timeout_floor(frame.len(), timeout, config);
    let backoff = Duration::from_millis(config.retry_backoff_ms);

    for attempt in 1..=config.write_tries {
        match tokio::time::timeout(effective, write_chunks(channel, &frame)).await {
            Ok(Ok(())) => {
                if attempt > 1 {
                    tracing::debug!(attempt, frame_len = frame.len(), "frame written after retry");
                }
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::debug!(attempt, error = %e, "frame write attempt failed");
            }
            Err(_) => {
                tracing::debug!(attempt, timeout_ms = effective.as_millis() as u64, "frame write attempt timed out");
            }
        }
        if attempt < config.write_tries {
            tokio::time::sleep(backoff).await;
        }
    }

    tracing::warn!(
        frame_len = frame.len(),
        tries = config.write_tries,
        head = %hex::encode(&frame[..frame.len().min(20)]),
        "frame write failed, try budget exhausted"
    );
    Err(ConnectorError::WriteFailed)
}

/// Encode and write one frame with a single attempt. Best-effort path.
pub async fn transmit_frame(
    channel: &dyn FrameChannel,
    frame_type: u32,
    payload: &[u8],
    timeout: Duration,
    config: &LinkConfig,
) -> Result<(), ConnectorError> {
    let frame =
        encode_frame(frame_type, 0, payload).map_err(|_| ConnectorError::WriteFailed)?;
    let effective = write_timeout_floor(frame.len(), timeout, config);
    match tokio::time::timeout(effective, write_chunks(channel, &frame)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::WriteFailed),
    }
}

/// Write a frame then await its response within `timeout + grace`.
///
/// A response that never arrives leaves the half-duplex channel in an
/// ambiguous state — the caller must disconnect on `ResponseTimeout`
/// rather than reuse the channel.
pub async fn request_frame(
    channel: &dyn FrameChannel,
    frame_type: u32,
    payload: &[u8],
    timeout: Duration,
    config: &LinkConfig,
) -> Result<Bytes, ConnectorError> {
    deliver_frame(
        channel,
        frame_type,
        timeout.as_millis() as u32,
        payload,
        timeout,
        config,
    )
    .await?;

    let deadline = timeout + Duration::from_millis(config.response_grace_ms);
    match tokio::time::timeout(deadline, channel.read_response()).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::ResponseTimeout),
    }
}

async fn write_chunks(channel: &dyn FrameChannel, frame: &[u8]) -> Result<(), ConnectorError> {
    let chunk_size = channel.chunk_size();
    for chunk in frame.chunks(chunk_size) {
        channel.write_chunk(chunk).await?;
    }
    Ok(())
}

// ── Notification reassembly ───────────────────────────────────────────────────

/// Reassembles notification chunks into complete messages.
///
/// Connectionless-style channels (BLE characteristic notifications) deliver
/// one chunk per callback with no framing of their own. A chunk of exactly
/// [`CONTINUE_CHUNK_SIZE`] bytes means more follow; any other length
/// terminates the message. One outstanding message per channel.
#[derive(Debug, Default)]
pub struct NotificationAssembler {
    buf: BytesMut,
}

impl NotificationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one notification chunk. Returns the assembled message once the
    /// terminating chunk arrives.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.put_slice(chunk);
        if chunk.len() == CONTINUE_CHUNK_SIZE {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    /// Drop any partially assembled message (channel reset).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
