//! Wire format: 5-byte frame header.
//!
//! ```text
//! +-------+----------------+------------------+
//! | Flags | Payload Length | Payload          |
//! | 1 B   | 4 B (BE u32)   | N bytes          |
//! +-------+----------------+------------------+
//! ```
//!
//! Flags layout:
//!
//! ```text
//! bit 0     codec (0 = JSON, 1 = MessagePack)
//! bit 1     direction (1 = server to client)
//! bits 2-4  frame kind (request, reply, chunk, event, control)
//! bits 5-7  reserved, must be 0
//! ```

use crate::codec::WireCodec;
use crate::error::{Result, WireError};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 5;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Flag bits.
pub mod flags {
    /// Payload is MessagePack (otherwise JSON).
    pub const CODEC_MSGPACK: u8 = 0b0000_0001;
    /// Frame travels server to client.
    pub const FROM_SERVER: u8 = 0b0000_0010;
    /// Frame kind field.
    pub const KIND_MASK: u8 = 0b0001_1100;
    pub const KIND_SHIFT: u8 = 2;
    /// Reserved bits (must be 0).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client to server: execute, batch, cancel.
    Request = 0,
    /// Server to client: the single reply to a request.
    Reply = 1,
    /// Server to client: one chunk of a streaming reply.
    Chunk = 2,
    /// Server to client: push event, never correlated with a request.
    Event = 3,
    /// Either direction: handshake.
    Control = 4,
}

impl FrameKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(FrameKind::Request),
            1 => Some(FrameKind::Reply),
            2 => Some(FrameKind::Chunk),
            3 => Some(FrameKind::Event),
            4 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

/// Frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: u8,
    pub payload_length: u32,
}

impl Header {
    pub fn new(flags: u8, payload_length: u32) -> Self {
        Self {
            flags,
            payload_length,
        }
    }

    /// Compose the flags for a frame.
    pub fn compose(kind: FrameKind, codec: WireCodec, from_server: bool, payload_length: u32) -> Self {
        let mut flags = (kind as u8) << flags::KIND_SHIFT;
        if codec == WireCodec::MsgPack {
            flags |= flags::CODEC_MSGPACK;
        }
        if from_server {
            flags |= flags::FROM_SERVER;
        }
        Self::new(flags, payload_length)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.flags;
        buf[1..5].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Returns `None` if the buffer is shorter than [`HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[0],
            payload_length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }

    /// Reject reserved bits, unknown kinds and oversized payloads.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(WireError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.kind().is_none() {
            return Err(WireError::Protocol(format!(
                "Unknown frame kind in flags {:#04x}",
                self.flags
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(WireError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }

    #[inline]
    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_bits((self.flags & flags::KIND_MASK) >> flags::KIND_SHIFT)
    }

    #[inline]
    pub fn codec(&self) -> WireCodec {
        if flags::has_flag(self.flags, flags::CODEC_MSGPACK) {
            WireCodec::MsgPack
        } else {
            WireCodec::Json
        }
    }

    #[inline]
    pub fn is_from_server(&self) -> bool {
        flags::has_flag(self.flags, flags::FROM_SERVER)
    }
}
