//! Serial stream decoder — interleaved text/binary protocol.
//!
//! The serial transport shares one byte stream between small ASCII control
//! tokens and binary frames. The literal marker `DATA=` switches the decoder
//! into binary mode; once the header-declared payload length is consumed it
//! falls back to text mode. The decoder is fed one byte at a time and makes
//! no assumption about how reads are chunked.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::FromBytes;

use lantern_core::wire::{crc32, FrameHeader, WireError, HEADER_SIZE, MAX_PAYLOAD};

/// Marker that switches the stream from text to binary mode.
pub const DATA_MARKER: &[u8] = b"DATA=";

/// Text lines longer than this are flushed as plain lines, so a stream with
/// no newlines cannot grow the buffer without bound.
pub const MAX_TEXT_LINE: usize = 512;

/// ASCII control tokens the firmware interleaves with binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlToken {
    Begin,
    End,
    Success,
    Fail,
    Error(String),
    /// A text line that is not a recognized token (boot logs etc.).
    Line(String),
}

/// One decoded unit from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(ControlToken),
    Frame { header: FrameHeader, payload: Bytes },
}

enum State {
    Text { line: Vec<u8> },
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    Data { header: FrameHeader, buf: BytesMut, need: usize },
}

/// Re-entrant decoder for the serial control channel.
pub struct StreamDecoder {
    state: State,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Text { line: Vec::new() },
        }
    }

    /// Feed one byte. Yields at most one event per byte.
    ///
    /// Integrity failures reset the decoder to text mode — the stream is
    /// resynchronized at the next marker or newline.
    pub fn push(&mut self, byte: u8) -> Result<Option<StreamEvent>, WireError> {
        match &mut self.state {
            State::Text { line } => {
                line.push(byte);
                if line.ends_with(DATA_MARKER) {
                    self.state = State::Header {
                        buf: [0u8; HEADER_SIZE],
                        filled: 0,
                    };
                    return Ok(None);
                }
                if byte == b'\n' {
                    let raw = std::mem::take(line);
                    let text = String::from_utf8_lossy(&raw);
                    let text = text.trim_end_matches(['\r', '\n']);
                    if text.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(StreamEvent::Token(parse_token(text))));
                }
                if line.len() >= MAX_TEXT_LINE {
                    // Keep a marker-sized tail so a DATA= split across the
                    // flush boundary still switches modes.
                    let keep = line.split_off(line.len() - (DATA_MARKER.len() - 1));
                    let flushed = std::mem::replace(line, keep);
                    let text = String::from_utf8_lossy(&flushed).into_owned();
                    return Ok(Some(StreamEvent::Token(ControlToken::Line(text))));
                }
                Ok(None)
            }

            State::Header { buf, filled } => {
                buf[*filled] = byte;
                *filled += 1;
                if *filled < HEADER_SIZE {
                    return Ok(None);
                }

                let header = match FrameHeader::read_from(buf.as_slice()) {
                    Some(h) => h,
                    None => {
                        self.reset();
                        return Err(WireError::TruncatedHeader);
                    }
                };
                if crc32(&buf[..16]) != { header.header_crc } {
                    self.reset();
                    return Err(WireError::HeaderCrcMismatch);
                }
                let need = { header.payload_size } as usize;
                if need > MAX_PAYLOAD {
                    self.reset();
                    return Err(WireError::PayloadTooLarge(need));
                }

                if need == 0 {
                    self.reset();
                    return Ok(Some(StreamEvent::Frame {
                        header,
                        payload: Bytes::new(),
                    }));
                }
                self.state = State::Data {
                    header,
                    buf: BytesMut::with_capacity(need),
                    need,
                };
                Ok(None)
            }

            State::Data { header, buf, need } => {
                buf.put_u8(byte);
                if buf.len() < *need {
                    return Ok(None);
                }

                let payload = buf.split().freeze();
                let expected = { header.payload_crc };
                let header = *header;
                self.reset();
                if crc32(&payload) != expected {
                    return Err(WireError::PayloadCrcMismatch);
                }
                Ok(Some(StreamEvent::Frame { header, payload }))
            }
        }
    }

    /// Feed a read buffer of arbitrary size, collecting every event.
    /// The first integrity error aborts the batch.
    pub fn push_slice(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, WireError> {
        let mut events = Vec::new();
        for &byte in bytes {
            if let Some(event) = self.push(byte)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn reset(&mut self) {
        self.state = State::Text { line: Vec::new() };
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_token(line: &str) -> ControlToken {
    match line {
        ">>>BEGIN<<<" => ControlToken::Begin,
        ">>>END<<<" => ControlToken::End,
        ">>>SUCCESS<<<" => ControlToken::Success,
        ">>>FAIL<<<" => ControlToken::Fail,
        _ => {
            if let Some(rest) = line.strip_prefix(">>>ERROR=") {
                ControlToken::Error(rest.trim_end_matches("<<<").to_string())
            } else {
                ControlToken::Line(line.to_string())
            }
        }
    }
}
