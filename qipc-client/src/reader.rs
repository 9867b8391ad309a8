//! Frame reader.
//!
//! Reads one message at a time from a live stream or from a message already
//! held in memory. Both sources share one decoding path; only byte
//! acquisition differs.

use crate::error::ClientError;
use bytes::Bytes;
use qipc_protocol::compress;
use qipc_protocol::{
    DecodeContext, Endianness, Header, Message, Options, Payload, ProtocolError, TextEncoding,
    ValueCodec, HEADER_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial buffer capacity for payload reads.
const READ_CHUNK: usize = 64 * 1024;

/// Where message bytes come from.
#[derive(Debug)]
pub enum Source<S> {
    /// A live stream; reads suspend until the bytes arrive.
    Stream(S),
    /// An in-memory chunk, consumed from the front.
    Bytes(Bytes),
}

/// Reads framed messages.
#[derive(Debug)]
pub struct FrameReader<S> {
    source: Source<S>,
    protocol_version: u8,
    encoding: TextEncoding,
    /// Byte order declared by the last header read.
    endianness: Endianness,
}

impl<S> FrameReader<S> {
    /// Creates a reader bound to a stream.
    pub fn new(stream: S, protocol_version: u8, encoding: TextEncoding) -> Self {
        Self {
            source: Source::Stream(stream),
            protocol_version,
            encoding,
            endianness: Endianness::native(),
        }
    }

    pub fn is_stream_backed(&self) -> bool {
        matches!(self.source, Source::Stream(_))
    }

    /// Byte order of the last header read.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Whether the last header's byte order matches the host's.
    pub fn is_native(&self) -> bool {
        self.endianness.is_native()
    }

    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            endianness: self.endianness,
            protocol_version: self.protocol_version,
            encoding: self.encoding,
        }
    }

    /// Returns the stream, if this reader is stream-backed.
    pub fn into_stream(self) -> Option<S> {
        match self.source {
            Source::Stream(stream) => Some(stream),
            Source::Bytes(_) => None,
        }
    }
}

impl FrameReader<tokio::io::Empty> {
    /// Creates a reader over a message already received.
    pub fn from_bytes(chunk: Bytes, protocol_version: u8, encoding: TextEncoding) -> Self {
        Self {
            source: Source::Bytes(chunk),
            protocol_version,
            encoding,
            endianness: Endianness::native(),
        }
    }
}

impl<S: AsyncRead + Unpin> FrameReader<S> {
    /// Reads and decodes one message.
    pub async fn read<C: ValueCodec>(
        &mut self,
        codec: &C,
        options: &Options,
    ) -> Result<Message<C::Value>, ClientError> {
        let header = self.read_header().await?;
        let data = self.read_data(&header).await?;

        let payload = if options.is_raw() {
            Payload::Raw(data)
        } else {
            let value = codec
                .decode(&data, &self.decode_context(), options)
                .map_err(ClientError::codec)?;
            Payload::Value(value)
        };

        Ok(Message {
            kind: header.kind,
            size: header.size,
            compression_mode: header.compression_mode,
            payload,
        })
    }

    /// Reads the 8-byte header and records its byte order.
    pub async fn read_header(&mut self) -> Result<Header, ProtocolError> {
        let bytes = self.read_bytes(HEADER_SIZE).await?;
        let header = Header::decode(&bytes)?;
        self.endianness = header.endianness;

        tracing::debug!(
            "Read {} header: {} bytes, compression mode {}",
            header.kind,
            header.size,
            header.compression_mode
        );
        Ok(header)
    }

    /// Reads the payload described by `header`, expanding compressed data.
    pub async fn read_data(&mut self, header: &Header) -> Result<Bytes, ProtocolError> {
        let payload_len =
            usize::try_from(header.payload_len()).map_err(|_| ProtocolError::FrameTooLarge {
                size: header.size,
                max: usize::MAX as u64,
            })?;

        if !header.is_compressed() {
            return self.read_bytes(payload_len).await;
        }

        let field_len = compress::length_field_len(header.compression_mode);
        let block_len = payload_len
            .checked_sub(field_len)
            .ok_or(ProtocolError::InvalidSize(header.size))?;

        // Both parts are consumed before validation so a stream stays aligned
        // on the next header.
        let field = self.read_bytes(field_len).await?;
        let block = self.read_bytes(block_len).await?;

        let size = compress::uncompressed_size(header.compression_mode, &field, header.endianness)?;
        let data = compress::decompress(&block, size)?;
        tracing::debug!("Decompressed {} bytes into {}", block_len, size);
        Ok(Bytes::from(data))
    }

    async fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        match &mut self.source {
            Source::Stream(stream) => {
                // The buffer grows with the bytes received, not with the size
                // the peer announced.
                let mut buf = Vec::with_capacity(n.min(READ_CHUNK));
                let read = AsyncReadExt::take(&mut *stream, n as u64)
                    .read_to_end(&mut buf)
                    .await?;
                if read < n {
                    return Err(ProtocolError::UnexpectedEof { needed: n });
                }
                Ok(Bytes::from(buf))
            }
            Source::Bytes(chunk) => {
                if chunk.len() < n {
                    return Err(ProtocolError::Truncated {
                        needed: n,
                        available: chunk.len(),
                    });
                }
                Ok(chunk.split_to(n))
            }
        }
    }
}
