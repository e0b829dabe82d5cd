//! Fixed 16-byte frame header.
//!
//! ```text
//! ┌──────┬───────┬──────────┬──────────┬─────┬──────┬──────────┐
//! │ Type │ Flags │ Sequence │ Length   │ Ser │ Comp │ CRC-32   │
//! │ 1    │ 1     │ u32 BE   │ u32 BE   │ 1   │ 1    │ u32 BE   │
//! └──────┴───────┴──────────┴──────────┴─────┴──────┴──────────┘
//! ```
//!
//! Fields are written one at a time so the layout never depends on host
//! byte order or struct padding.

use serde::{Deserialize, Serialize};

use super::message::MessageType;
use crate::core::{Error, Result};

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Flag bits carried in the second header byte
pub mod flags {
    /// Sequence number was supplied by the caller, not the allocator
    pub const SEQUENCE_OVERRIDE: u8 = 0b0000_0001;
    /// Frame reports a server-side error
    pub const ERROR: u8 = 0b0000_0010;
    /// Bits that must be zero
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Payload serialization method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serialization {
    /// Literal bytes, audio-only frames
    Raw,
    /// JSON object, snake_case keys
    Json,
}

impl Serialization {
    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            Serialization::Raw => 0x00,
            Serialization::Json => 0x01,
        }
    }

    /// Parses a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(Serialization::Raw),
            0x01 => Ok(Serialization::Json),
            other => Err(Error::unsupported(format!(
                "serialization method {:#04x}",
                other
            ))),
        }
    }
}

/// Payload compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            Compression::None => 0x00,
            Compression::Gzip => 0x01,
        }
    }

    /// Parses a wire code
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(Compression::None),
            0x01 => Ok(Compression::Gzip),
            other => Err(Error::unsupported(format!(
                "compression method {:#04x}",
                other
            ))),
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message type tag
    pub message_type: MessageType,
    /// Flag bits (see `flags`)
    pub flags: u8,
    /// Per-connection sequence number
    pub sequence: u32,
    /// Length of the payload as transmitted
    pub payload_length: u32,
    /// How the payload is serialized
    pub serialization: Serialization,
    /// How the payload is compressed
    pub compression: Compression,
    /// CRC-32 over the payload as transmitted
    pub checksum: u32,
}

impl Header {
    /// Encode header to bytes (Big Endian)
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.message_type.tag();
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.sequence.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[10] = self.serialization.code();
        buf[11] = self.compression.code();
        buf[12..16].copy_from_slice(&self.checksum.to_be_bytes());
    }

    /// Decode and validate a header.
    ///
    /// Fails with `Incomplete` on a short buffer and with an unsupported
    /// error on an unknown tag, method, or reserved flag bit.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Incomplete {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }

        let message_type = MessageType::from_tag(buf[0])?;
        let flags = buf[1];
        if flags & flags::RESERVED_MASK != 0 {
            return Err(Error::unsupported(format!(
                "reserved flag bits set: {:#010b}",
                flags
            )));
        }

        Ok(Header {
            message_type,
            flags,
            sequence: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            serialization: Serialization::from_code(buf[10])?,
            compression: Compression::from_code(buf[11])?,
            checksum: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Total frame size (header plus payload)
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }

    /// Whether the sequence was supplied by the caller
    #[inline]
    pub fn has_sequence_override(&self) -> bool {
        flags::has_flag(self.flags, flags::SEQUENCE_OVERRIDE)
    }

    /// Whether the frame reports an error
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::ERROR)
    }
}
