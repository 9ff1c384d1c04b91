//! Framed transport codec.
//!
//! Frame layout (4 bytes header + payload):
//!
//! ```text
//! +------------------+--------+---------------+
//! | eof | mode_in<<4 |  mode  | payload_len   |
//! |      1 byte      | 1 byte | 2 bytes (BE)  |
//! +------------------+--------+---------------+
//! | payload (payload_len bytes, compressed per mode)
//! +-------------------------------------------+
//! ```
//!
//! A logical message is a run of frames ending with `eof = 1`. A header of
//! `10 20 30 40` is not a frame but the start of a 21-byte heartbeat record,
//! which the peer expects to be answered with a single echo byte.

use crate::compress::{CompressMode, Compressor};
use crate::error::ProtocolError;
use crate::v3;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header in bytes.
pub const HEAD_SIZE: usize = 4;

/// Default and maximum page size (header + payload of one frame).
pub const DEFAULT_PAGE_SIZE: usize = 65536;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest payload any frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = MAX_PAGE_SIZE - HEAD_SIZE;

/// Leading bytes of a heartbeat record.
pub const HEARTBEAT_MAGIC: [u8; 4] = v3::MAGIC.to_be_bytes();

/// Full length of a heartbeat record.
pub const HEARTBEAT_LEN: usize = 21;

/// Byte written back in answer to a heartbeat.
pub const ECHO_BYTE: u8 = 0x01;

const EOF_BIT: u8 = 0x01;

/// Builds the 21-byte heartbeat record: magic, echo url, zero padding.
pub fn heartbeat_record() -> [u8; HEARTBEAT_LEN] {
    let mut rec = [0u8; HEARTBEAT_LEN];
    rec[..4].copy_from_slice(&HEARTBEAT_MAGIC);
    rec[4..8].copy_from_slice(&v3::URL_ECHO.to_be_bytes());
    rec
}

/// Clamps a requested page size into the supported range.
pub fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Last frame of the logical message.
    pub eof: bool,
    /// Mode the sender is configured for.
    pub configured: CompressMode,
    /// Mode of the payload actually on the wire.
    pub mode: CompressMode,
    pub len: u16,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let len = self.len.to_be_bytes();
        [
            (self.configured.code() << 4) | (self.eof as u8),
            self.mode.code(),
            len[0],
            len[1],
        ]
    }

    /// Decodes a header. Only the wire mode byte is validated.
    pub fn decode(head: [u8; HEAD_SIZE]) -> Result<Self, ProtocolError> {
        let mode = CompressMode::try_from(head[1])?;
        let configured = CompressMode::try_from(head[0] >> 4).unwrap_or(mode);
        Ok(Self {
            eof: head[0] & EOF_BIT != 0,
            configured,
            mode,
            len: u16::from_be_bytes([head[2], head[3]]),
        })
    }
}

/// Returns whether `head` starts a heartbeat record.
pub fn is_heartbeat(head: &[u8]) -> bool {
    head.len() >= HEAD_SIZE && head[..HEAD_SIZE] == HEARTBEAT_MAGIC
}

/// Splits payloads into frames, compressing each chunk when it pays off.
#[derive(Debug)]
pub struct FrameEncoder {
    page_size: usize,
    mode: CompressMode,
    compressor: Compressor,
}

impl FrameEncoder {
    pub fn new(page_size: usize, mode: CompressMode) -> Self {
        Self {
            page_size: clamp_page_size(page_size),
            mode,
            compressor: Compressor::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Largest raw payload carried by one frame.
    pub fn max_payload(&self) -> usize {
        self.page_size - HEAD_SIZE
    }

    pub fn mode(&self) -> CompressMode {
        self.mode
    }

    /// Changes the mode used for subsequent frames.
    pub fn set_mode(&mut self, mode: CompressMode) {
        self.mode = mode;
    }

    /// Writes one frame carrying `chunk`.
    ///
    /// The header mode records the bytes actually written: when compression
    /// does not shrink the chunk, it goes out raw with mode 0.
    pub fn encode_frame(
        &mut self,
        chunk: &[u8],
        eof: bool,
        out: &mut BytesMut,
    ) -> Result<CompressMode, ProtocolError> {
        if chunk.len() > self.max_payload() {
            return Err(ProtocolError::FrameTooLarge {
                size: chunk.len(),
                max: self.max_payload(),
            });
        }
        let configured = self.mode;
        let (mode, body) = match self.compressor.compress(configured, chunk) {
            Some(packed) => (configured, packed),
            None => (CompressMode::Raw, chunk),
        };
        let header = FrameHeader {
            eof,
            configured,
            mode,
            len: body.len() as u16,
        };
        out.reserve(HEAD_SIZE + body.len());
        out.put_slice(&header.encode());
        out.put_slice(body);
        Ok(mode)
    }

    /// Writes a whole message as consecutive frames, the last one marked eof.
    ///
    /// Returns the number of frames written. An empty payload still produces
    /// one empty eof frame.
    pub fn encode_message(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<usize, ProtocolError> {
        let max = self.max_payload();
        if payload.is_empty() {
            self.encode_frame(&[], true, out)?;
            return Ok(1);
        }
        let mut frames = 0;
        let mut chunks = payload.chunks(max).peekable();
        while let Some(chunk) = chunks.next() {
            self.encode_frame(chunk, chunks.peek().is_none(), out)?;
            frames += 1;
        }
        Ok(frames)
    }
}

/// One unit read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// A heartbeat record; the reader must answer it with [`ECHO_BYTE`].
    Heartbeat(Bytes),
    /// A data frame with its payload already decompressed.
    Data {
        eof: bool,
        mode: CompressMode,
        payload: Bytes,
    },
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    compressor: Compressor,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next frame from `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was consumed,
    /// `Ok(None)` if more data is needed, or `Err` on framing errors.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodedFrame>, ProtocolError> {
        if buf.len() < HEAD_SIZE {
            return Ok(None);
        }
        if is_heartbeat(buf) {
            if buf.len() < HEARTBEAT_LEN {
                return Ok(None);
            }
            return Ok(Some(DecodedFrame::Heartbeat(buf.split_to(HEARTBEAT_LEN).freeze())));
        }

        let header = FrameHeader::decode([buf[0], buf[1], buf[2], buf[3]])?;
        let len = header.len as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        if buf.len() < HEAD_SIZE + len {
            buf.reserve(HEAD_SIZE + len - buf.len());
            return Ok(None);
        }

        buf.advance(HEAD_SIZE);
        let body = buf.split_to(len).freeze();
        let payload = match header.mode {
            CompressMode::Raw => body,
            mode => Bytes::copy_from_slice(self.compressor.decompress(mode, &body)?),
        };
        Ok(Some(DecodedFrame::Data {
            eof: header.eof,
            mode: header.mode,
            payload,
        }))
    }
}
