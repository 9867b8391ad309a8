//! # qipc-protocol
//!
//! Wire format for the q IPC protocol.
//!
//! This crate provides:
//! - The 8-byte message header with declared endianness and 40-bit sizes
//! - Message kinds, messages and per-call options
//! - The value codec seam (`ValueCodec`) with a pass-through `RawCodec`
//! - The compression envelope and block decompressor
//! - Error types and protocol constants

pub mod codec;
pub mod compress;
pub mod error;
pub mod header;
pub mod message;

pub use codec::{BoxError, DecodeContext, EncodeContext, RawCodec, ValueCodec};
pub use error::ProtocolError;
pub use header::{Endianness, Header, MessageKind, HEADER_SIZE};
pub use message::{Message, Options, Payload, TextEncoding};

/// Highest protocol version this client offers during the handshake.
pub const MAX_PROTOCOL_VERSION: u8 = 6;

/// Lowest negotiated protocol version that allows the size-extension byte.
pub const EXTENDED_SIZE_MIN_VERSION: u8 = 6;

/// Maximum number of arguments in a function-call message.
pub const MAX_PARAMETERS: usize = 8;

/// Largest total message size expressible in a header (40 bits).
pub const MAX_MESSAGE_SIZE: u64 = (1 << 40) - 1;

/// Default port of a q service.
pub const DEFAULT_PORT: u16 = 5000;
