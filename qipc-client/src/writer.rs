//! Frame writer.

use crate::error::ClientError;
use bytes::{BufMut, Bytes, BytesMut};
use qipc_protocol::{
    EncodeContext, Endianness, Header, MessageKind, Options, ProtocolError, TextEncoding,
    ValueCodec, EXTENDED_SIZE_MIN_VERSION, HEADER_SIZE,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Initial capacity of a frame buffer.
const FRAME_BUFFER_CAPACITY: usize = 4 * 1024;

/// Writes framed messages.
///
/// A stream-backed writer sends each frame and waits for the flush; a
/// detached writer hands the assembled frame back instead.
#[derive(Debug)]
pub struct FrameWriter<S> {
    stream: Option<S>,
    protocol_version: u8,
    encoding: TextEncoding,
}

impl<S> FrameWriter<S> {
    /// Creates a writer bound to a stream.
    pub fn new(stream: S, protocol_version: u8, encoding: TextEncoding) -> Self {
        Self {
            stream: Some(stream),
            protocol_version,
            encoding,
        }
    }

    pub fn is_stream_backed(&self) -> bool {
        self.stream.is_some()
    }

    pub fn encode_context(&self) -> EncodeContext {
        EncodeContext {
            endianness: Endianness::native(),
            protocol_version: self.protocol_version,
            encoding: self.encoding,
        }
    }

    /// Returns the stream, if this writer is stream-backed.
    pub fn into_stream(self) -> Option<S> {
        self.stream
    }
}

impl FrameWriter<tokio::io::Sink> {
    /// Creates a writer that returns frames instead of sending them.
    pub fn detached(protocol_version: u8, encoding: TextEncoding) -> Self {
        Self {
            stream: None,
            protocol_version,
            encoding,
        }
    }
}

impl<S: AsyncWrite + Unpin> FrameWriter<S> {
    /// Frames `value` as a message of `kind`.
    ///
    /// Returns the frame when detached, `None` once a stream accepted it.
    pub async fn write<C: ValueCodec>(
        &mut self,
        codec: &C,
        value: &C::Value,
        kind: MessageKind,
        options: &Options,
    ) -> Result<Option<Bytes>, ClientError> {
        let ctx = self.encode_context();
        let frame = build_frame(kind, self.protocol_version, |buf| {
            codec
                .encode(value, &ctx, options, buf)
                .map_err(ClientError::codec)
        })?;
        self.send(frame).await
    }

    /// Frames the call form `[function, arguments...]` as a message of `kind`.
    pub async fn write_call<C: ValueCodec>(
        &mut self,
        codec: &C,
        function: &C::Value,
        arguments: &[C::Value],
        kind: MessageKind,
        options: &Options,
    ) -> Result<Option<Bytes>, ClientError> {
        let ctx = self.encode_context();
        let frame = build_frame(kind, self.protocol_version, |buf| {
            codec
                .encode_call(function, arguments, &ctx, options, buf)
                .map_err(ClientError::codec)
        })?;
        self.send(frame).await
    }

    async fn send(&mut self, frame: BytesMut) -> Result<Option<Bytes>, ClientError> {
        match self.stream.as_mut() {
            Some(stream) => {
                stream.write_all(&frame).await?;
                stream.flush().await?;
                tracing::debug!("Wrote frame ({} bytes)", frame.len());
                Ok(None)
            }
            None => Ok(Some(frame.freeze())),
        }
    }
}

/// Assembles header and payload in one buffer.
fn build_frame<F>(kind: MessageKind, protocol_version: u8, encode: F) -> Result<BytesMut, ClientError>
where
    F: FnOnce(&mut BytesMut) -> Result<(), ClientError>,
{
    let mut buf = BytesMut::with_capacity(FRAME_BUFFER_CAPACITY);
    buf.put_bytes(0, HEADER_SIZE);
    encode(&mut buf)?;

    let size = buf.len() as u64;
    check_size(size, protocol_version)?;
    let header = Header::new(kind, size).encode()?;
    buf[..HEADER_SIZE].copy_from_slice(&header);
    Ok(buf)
}

/// Frames past 32 bits need the size-extension byte, which older peers lack.
fn check_size(size: u64, protocol_version: u8) -> Result<(), ProtocolError> {
    if size > u64::from(u32::MAX) && protocol_version < EXTENDED_SIZE_MIN_VERSION {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: u64::from(u32::MAX),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::FrameReader;
    use qipc_protocol::{Payload, RawCodec, MAX_MESSAGE_SIZE, MAX_PROTOCOL_VERSION};
    use tokio_test::io::Builder;

    fn long_atom(value: i64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0xf9);
        match Endianness::native() {
            Endianness::Little => buf.put_i64_le(value),
            Endianness::Big => buf.put_i64(value),
        }
        buf.freeze()
    }

    #[tokio::test]
    async fn test_detached_write_returns_frame() {
        let mut writer = FrameWriter::detached(MAX_PROTOCOL_VERSION, TextEncoding::Latin1);
        assert!(!writer.is_stream_backed());

        let value = long_atom(42);
        let frame = writer
            .write(&RawCodec, &value, MessageKind::Sync, &Options::new())
            .await
            .unwrap()
            .unwrap();

        let header = Header::decode(&frame).unwrap();
        assert_eq!(header.kind, MessageKind::Sync);
        assert_eq!(header.size, frame.len() as u64);
        assert_eq!(header.endianness, Endianness::native());
        assert_eq!(header.compression_mode, 0);
        assert_eq!(&frame[HEADER_SIZE..], value.as_ref());
    }

    #[tokio::test]
    async fn test_stream_write() {
        let value = long_atom(7);
        let mut detached = FrameWriter::detached(3, TextEncoding::Latin1);
        let expected = detached
            .write(&RawCodec, &value, MessageKind::Async, &Options::new())
            .await
            .unwrap()
            .unwrap();

        let mock = Builder::new().write(&expected).build();
        let mut writer = FrameWriter::new(mock, 3, TextEncoding::Latin1);
        let result = writer
            .write(&RawCodec, &value, MessageKind::Async, &Options::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_write_call() {
        let mut writer = FrameWriter::detached(MAX_PROTOCOL_VERSION, TextEncoding::Latin1);
        let function = RawCodec::string("{x*y}", &writer.encode_context()).unwrap();
        let arguments = [long_atom(6), long_atom(7)];

        let frame = writer
            .write_call(
                &RawCodec,
                &function,
                &arguments,
                MessageKind::Sync,
                &Options::new(),
            )
            .await
            .unwrap()
            .unwrap();

        let header = Header::decode(&frame).unwrap();
        assert_eq!(
            header.payload_len() as usize,
            6 + function.len() + 2 * arguments[0].len()
        );
        assert_eq!(frame[HEADER_SIZE], 0);
    }

    #[tokio::test]
    async fn test_written_frame_reads_back() {
        let value = long_atom(-1);
        let mut writer = FrameWriter::detached(MAX_PROTOCOL_VERSION, TextEncoding::Latin1);
        let frame = writer
            .write(&RawCodec, &value, MessageKind::Response, &Options::new())
            .await
            .unwrap()
            .unwrap();

        let mut reader = FrameReader::from_bytes(frame, MAX_PROTOCOL_VERSION, TextEncoding::Latin1);
        let message = reader.read(&RawCodec, &Options::new()).await.unwrap();
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.payload, Payload::Value(value));
        assert!(reader.is_native());
    }

    #[test]
    fn test_size_limits() {
        let beyond_u32 = u64::from(u32::MAX) + 1;
        assert!(check_size(u64::from(u32::MAX), 1).is_ok());
        assert!(matches!(
            check_size(beyond_u32, 5),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(check_size(beyond_u32, EXTENDED_SIZE_MIN_VERSION).is_ok());
        assert!(Header::new(MessageKind::Sync, MAX_MESSAGE_SIZE + 1)
            .encode()
            .is_err());
    }
}
