//! Value codec seam.
//!
//! The framing layer never interprets payload bytes; it hands them to a
//! [`ValueCodec`]. [`RawCodec`] is the default: its values are payloads that
//! are already encoded, so it can frame hand-built or forwarded objects.

use crate::header::Endianness;
use crate::message::{Options, TextEncoding};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;

/// Boxed codec error, carried unchanged through the client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type byte of a general list.
const GENERAL_LIST: u8 = 0;

/// Type byte of a char vector.
const CHAR_VECTOR: u8 = 10;

/// Type byte of an error value (-128).
const ERROR_TYPE: u8 = 0x80;

/// Parameters the writer passes to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeContext {
    pub endianness: Endianness,
    pub protocol_version: u8,
    pub encoding: TextEncoding,
}

/// Parameters the reader passes to the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Byte order declared by the message header.
    pub endianness: Endianness,
    pub protocol_version: u8,
    pub encoding: TextEncoding,
}

impl DecodeContext {
    /// Whether the declared order matches the host's.
    pub fn is_native(&self) -> bool {
        self.endianness.is_native()
    }
}

/// Converts domain values to and from payload bytes.
pub trait ValueCodec: Send + Sync {
    type Value: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Appends the encoding of `value` to `out`.
    fn encode(
        &self,
        value: &Self::Value,
        ctx: &EncodeContext,
        options: &Options,
        out: &mut BytesMut,
    ) -> Result<(), Self::Error>;

    /// Appends the encoding of the call form `[function, arguments...]`.
    fn encode_call(
        &self,
        function: &Self::Value,
        arguments: &[Self::Value],
        ctx: &EncodeContext,
        options: &Options,
        out: &mut BytesMut,
    ) -> Result<(), Self::Error>;

    fn decode(
        &self,
        payload: &[u8],
        ctx: &DecodeContext,
        options: &Options,
    ) -> Result<Self::Value, Self::Error>;

    /// Builds the exception value sent to a peer whose message could not be
    /// handled.
    fn exception(&self, message: &str, ctx: &EncodeContext) -> Self::Value;
}

/// Pass-through codec over already-encoded values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl RawCodec {
    /// Encodes `text` as a char vector, the usual form of a query expression.
    pub fn string(text: &str, ctx: &EncodeContext) -> Result<Bytes, crate::ProtocolError> {
        let chars = ctx.encoding.encode(text)?;
        let mut buf = BytesMut::with_capacity(6 + chars.len());
        buf.put_u8(CHAR_VECTOR);
        buf.put_u8(0);
        ctx.endianness.put_u32(&mut buf, chars.len() as u32);
        buf.put_slice(&chars);
        Ok(buf.freeze())
    }

    /// Extracts the message of an encoded error value, if `payload` is one.
    pub fn error_text(payload: &[u8], encoding: TextEncoding) -> Option<String> {
        let (&type_byte, rest) = payload.split_first()?;
        if type_byte != ERROR_TYPE {
            return None;
        }
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        Some(encoding.decode(&rest[..end]))
    }
}

impl ValueCodec for RawCodec {
    type Value = Bytes;
    type Error = Infallible;

    fn encode(
        &self,
        value: &Bytes,
        _ctx: &EncodeContext,
        _options: &Options,
        out: &mut BytesMut,
    ) -> Result<(), Infallible> {
        out.put_slice(value);
        Ok(())
    }

    fn encode_call(
        &self,
        function: &Bytes,
        arguments: &[Bytes],
        ctx: &EncodeContext,
        _options: &Options,
        out: &mut BytesMut,
    ) -> Result<(), Infallible> {
        out.put_u8(GENERAL_LIST);
        out.put_u8(0);
        ctx.endianness.put_u32(out, (arguments.len() + 1) as u32);
        out.put_slice(function);
        for argument in arguments {
            out.put_slice(argument);
        }
        Ok(())
    }

    fn decode(
        &self,
        payload: &[u8],
        _ctx: &DecodeContext,
        _options: &Options,
    ) -> Result<Bytes, Infallible> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn exception(&self, message: &str, ctx: &EncodeContext) -> Bytes {
        let text = ctx
            .encoding
            .encode(message)
            .unwrap_or_else(|_| message.as_bytes().to_vec());
        let mut buf = BytesMut::with_capacity(text.len() + 2);
        buf.put_u8(ERROR_TYPE);
        buf.put_slice(&text);
        buf.put_u8(0);
        buf.freeze()
    }
}
