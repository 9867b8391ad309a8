//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream closed before {needed} bytes could be read")]
    UnexpectedEof { needed: usize },

    #[error("truncated message: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("invalid message size: {0} (header alone is 8 bytes)")]
    InvalidSize(u64),

    #[error("invalid uncompressed size in compression header: {0}")]
    InvalidUncompressedSize(i64),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("too many parameters: {count} (max {max})")]
    TooManyParameters { count: usize, max: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("character {ch:?} cannot be encoded as {encoding}")]
    Unencodable { ch: char, encoding: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
