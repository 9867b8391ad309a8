//! Message header.
//!
//! Header layout (8 bytes, followed by `size - 8` payload bytes):
//!
//! ```text
//! +------------+--------+-------------+----------+-------------------+
//! | endianness | kind   | compression | size_ext | size (low 32 bits)|
//! | 1 byte     | 1 byte | 1 byte      | 1 byte   | 4 bytes           |
//! +------------+--------+-------------+----------+-------------------+
//! ```
//!
//! The endianness marker is `1` for little-endian; any other value means
//! big-endian. The low size word and every multi-byte field of the payload
//! use the declared order, whatever the host's order is. The total size is
//! `size + (size_ext << 32)`.

use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Logical role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Fire-and-forget; the peer does not reply.
    Async = 0,
    /// Request expecting a `Response`.
    Sync = 1,
    /// Reply to a `Sync` request.
    Response = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Async),
            1 => Ok(MessageKind::Sync),
            2 => Ok(MessageKind::Response),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Async => write!(f, "ASYNC"),
            MessageKind::Sync => write!(f, "SYNC"),
            MessageKind::Response => write!(f, "RESPONSE"),
        }
    }
}

/// Byte order declared by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// The host's byte order.
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    /// Interprets header byte 0.
    pub fn from_marker(marker: u8) -> Self {
        if marker == 1 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    /// Header byte 0 for this order.
    pub fn marker(self) -> u8 {
        match self {
            Endianness::Little => 1,
            Endianness::Big => 0,
        }
    }

    pub fn is_native(self) -> bool {
        self == Self::native()
    }

    pub fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            Endianness::Little => buf.get_u32_le(),
            Endianness::Big => buf.get_u32(),
        }
    }

    pub fn get_i64(self, buf: &mut impl Buf) -> i64 {
        match self {
            Endianness::Little => buf.get_i64_le(),
            Endianness::Big => buf.get_i64(),
        }
    }

    pub fn put_u32(self, buf: &mut impl BufMut, value: u32) {
        match self {
            Endianness::Little => buf.put_u32_le(value),
            Endianness::Big => buf.put_u32(value),
        }
    }
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Byte order of the size field and the payload.
    pub endianness: Endianness,
    /// Message kind.
    pub kind: MessageKind,
    /// `0` when uncompressed; otherwise selects the compression header width.
    pub compression_mode: u8,
    /// Total message size, header included.
    pub size: u64,
}

impl Header {
    /// Creates an uncompressed header in the host's byte order.
    pub fn new(kind: MessageKind, size: u64) -> Self {
        Self {
            endianness: Endianness::native(),
            kind,
            compression_mode: 0,
            size,
        }
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_compression_mode(mut self, mode: u8) -> Self {
        self.compression_mode = mode;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_mode > 0
    }

    /// Number of bytes following the header.
    pub fn payload_len(&self) -> u64 {
        self.size.saturating_sub(HEADER_SIZE as u64)
    }

    /// Encodes the header into its 8-byte wire form.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        if self.size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if self.size < HEADER_SIZE as u64 {
            return Err(ProtocolError::InvalidSize(self.size));
        }

        let mut bytes = [0u8; HEADER_SIZE];
        let mut buf = &mut bytes[..];
        buf.put_u8(self.endianness.marker());
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.compression_mode);
        buf.put_u8((self.size >> 32) as u8);
        self.endianness.put_u32(&mut buf, self.size as u32);

        Ok(bytes)
    }

    /// Decodes a header from the first 8 bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        let endianness = Endianness::from_marker(buf.get_u8());
        let kind = MessageKind::try_from(buf.get_u8())?;
        let compression_mode = buf.get_u8();
        let size_ext = buf.get_u8() as u64;
        let size = endianness.get_u32(&mut buf) as u64 + (size_ext << 32);

        if size < HEADER_SIZE as u64 {
            return Err(ProtocolError::InvalidSize(size));
        }

        Ok(Self {
            endianness,
            kind,
            compression_mode,
            size,
        })
    }
}
