//! Connection management.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::handshake;
use crate::reader::FrameReader;
use crate::stream::IpcStream;
use crate::writer::FrameWriter;
use bytes::Bytes;
use qipc_protocol::{
    EncodeContext, Endianness, Message, MessageKind, Options, Payload, ProtocolError, RawCodec,
    ValueCodec, MAX_PARAMETERS, MAX_PROTOCOL_VERSION,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex, MutexGuard, Notify};

/// Exception text sent back when a response was expected.
const UNEXPECTED_MESSAGE_TEXT: &str = "nyi: qipc expected response message";

/// Reader and writer bound to one open stream.
struct Link {
    reader: FrameReader<ReadHalf<IpcStream>>,
    writer: FrameWriter<WriteHalf<IpcStream>>,
    /// Increases with every successful `open`.
    generation: u64,
}

#[derive(Default)]
struct Session {
    link: Option<Link>,
    /// SYNC queries written through `query` whose response is still unread.
    awaiting_replies: usize,
}

/// A connection to a q service.
///
/// The stream carries one message at a time, so every operation holds the
/// link for its whole write/read cycle; concurrent callers are served one
/// after another. A SYNC message written with [`query`](Self::query) stays
/// paired with the next RESPONSE read by [`receive`](Self::receive):
/// [`send_sync`](Self::send_sync) waits until every such response has been
/// read before writing its own request.
///
/// An operation whose future is dropped before it finishes (cancelled or
/// timed out) leaves the stream at an unknown position, and the connection
/// is closed rather than reused. So does an I/O failure partway through a
/// frame. [`close`](Self::close) interrupts an operation still waiting on
/// the peer.
pub struct Connection<C: ValueCodec = RawCodec> {
    config: ConnectionConfig,
    codec: C,
    session: Mutex<Session>,
    /// Is the connection established?
    connected: AtomicBool,
    protocol_version: AtomicU8,
    generation: AtomicU64,
    /// Highest link generation retired by `close`.
    retired: watch::Sender<u64>,
    /// Signalled when no `query` response is left to read.
    idle: Notify,
}

impl Connection<RawCodec> {
    /// Creates a new connection (not yet open) using the pass-through codec.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_codec(config, RawCodec)
    }

    /// Encodes `text` as a char vector for use as a query expression.
    pub fn string(&self, text: &str) -> Result<Bytes, ClientError> {
        let ctx = EncodeContext {
            endianness: Endianness::native(),
            protocol_version: self.protocol_version().unwrap_or(MAX_PROTOCOL_VERSION),
            encoding: self.config.encoding,
        };
        Ok(RawCodec::string(text, &ctx)?)
    }
}

impl<C: ValueCodec> Connection<C> {
    /// Creates a new connection (not yet open) using `codec`.
    pub fn with_codec(config: ConnectionConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            session: Mutex::new(Session::default()),
            connected: AtomicBool::new(false),
            protocol_version: AtomicU8::new(0),
            generation: AtomicU64::new(0),
            retired: watch::channel(0).0,
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Protocol version negotiated by the current handshake.
    pub fn protocol_version(&self) -> Option<u8> {
        self.is_connected()
            .then(|| self.protocol_version.load(Ordering::SeqCst))
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Opens the transport and performs the handshake. No-op when already open.
    pub async fn open(&self) -> Result<(), ClientError> {
        let mut session = self.session.lock().await;
        if session.link.is_some() {
            return Ok(());
        }
        let host = self.config.host.as_deref().ok_or(ClientError::MissingHost)?;

        let token = self.config.encoding.encode(&self.config.credentials())?;
        let config = &self.config;
        let (stream, version) =
            handshake::negotiate(move || IpcStream::connect(config), &token).await?;
        let tls = stream.is_tls();

        let (read_half, write_half) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.link = Some(Link {
            reader: FrameReader::new(read_half, version, self.config.encoding),
            writer: FrameWriter::new(write_half, version, self.config.encoding),
            generation,
        });
        session.awaiting_replies = 0;
        self.protocol_version.store(version, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        tracing::info!(
            "Connected to {}:{} (protocol v{}{})",
            host,
            self.config.port,
            version,
            if tls { ", TLS" } else { "" }
        );
        Ok(())
    }

    /// Closes the connection. Shutdown errors are logged, never returned.
    ///
    /// An operation in flight on the current link fails with
    /// [`ClientError::NotConnected`] instead of holding the close up.
    pub async fn close(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.retired.send_modify(|retired| *retired = (*retired).max(generation));

        let link = {
            let mut session = self.session.lock().await;
            session.awaiting_replies = 0;
            session.link.take()
        };
        self.connected.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();

        let Some(link) = link else {
            return;
        };
        tracing::debug!("Closing connection...");
        if let Some(mut writer) = link.writer.into_stream() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Shutdown failed: {}", e);
            }
        }
        tracing::debug!("Connection closed");
    }

    /// Writes `expression`, or the call `[expression, parameters...]`, as a
    /// message of `kind`.
    ///
    /// The response to a SYNC message is left for [`receive`](Self::receive)
    /// and no [`send_sync`](Self::send_sync) is written until it is read.
    pub async fn query(
        &self,
        kind: MessageKind,
        expression: &C::Value,
        parameters: &[C::Value],
        options: &Options,
    ) -> Result<(), ClientError> {
        self.with_timeout(async {
            let mut exchange = self.exchange().await?;
            let (link, retired) = exchange.parts()?;
            let generation = link.generation;
            let result = unless_retired(
                retired,
                generation,
                self.write_query(link, kind, expression, parameters, options),
            )
            .await?;
            if result.is_ok() && kind == MessageKind::Sync {
                exchange.session.awaiting_replies += 1;
            }
            exchange.finish(&result);
            result
        })
        .await
    }

    /// Sends a SYNC query and waits for its response.
    ///
    /// A reply of any other kind is answered with an exception value, since
    /// a nested request cannot be served here, and reported as
    /// [`ClientError::UnexpectedMessage`]. If that answer cannot be written
    /// the error is [`ClientError::NotifyFailed`] instead.
    pub async fn send_sync(
        &self,
        expression: &C::Value,
        parameters: &[C::Value],
        options: &Options,
    ) -> Result<Payload<C::Value>, ClientError> {
        self.with_timeout(async {
            let mut exchange = self.idle_exchange().await?;
            let (link, retired) = exchange.parts()?;
            let generation = link.generation;
            let result = unless_retired(
                retired,
                generation,
                self.round_trip(link, expression, parameters, options),
            )
            .await?;
            exchange.finish(&result);
            result
        })
        .await
    }

    /// Sends an ASYNC query without waiting for anything back.
    pub async fn send_async(
        &self,
        expression: &C::Value,
        parameters: &[C::Value],
        options: &Options,
    ) -> Result<(), ClientError> {
        self.query(MessageKind::Async, expression, parameters, options)
            .await
    }

    /// Reads the next message, whatever its kind.
    pub async fn receive_message(
        &self,
        options: &Options,
    ) -> Result<Message<C::Value>, ClientError> {
        self.with_timeout(async {
            let mut exchange = self.exchange().await?;
            let options = self.config.options.merged(options);
            let (link, retired) = exchange.parts()?;
            let generation = link.generation;
            let result = unless_retired(
                retired,
                generation,
                link.reader.read(&self.codec, &options),
            )
            .await?;
            if matches!(&result, Ok(message) if message.kind == MessageKind::Response) {
                exchange.reply_read();
            }
            exchange.finish(&result);
            result
        })
        .await
    }

    /// Reads the next message and returns its payload only.
    pub async fn receive(&self, options: &Options) -> Result<Payload<C::Value>, ClientError> {
        Ok(self.receive_message(options).await?.into_payload())
    }

    /// Shorthand for [`send_sync`](Self::send_sync) with default options.
    pub async fn call(
        &self,
        expression: &C::Value,
        parameters: &[C::Value],
    ) -> Result<Payload<C::Value>, ClientError> {
        self.send_sync(expression, parameters, &Options::new()).await
    }

    async fn exchange(&self) -> Result<Exchange<'_>, ClientError> {
        let session = self.session.lock().await;
        if session.link.is_none() {
            tracing::debug!("Operation called but not connected");
            return Err(ClientError::NotConnected);
        }
        Ok(Exchange {
            session,
            connected: &self.connected,
            idle: &self.idle,
            retired: self.retired.subscribe(),
            armed: true,
        })
    }

    /// Like [`exchange`](Self::exchange), once no `query` response is
    /// waiting to be read.
    async fn idle_exchange(&self) -> Result<Exchange<'_>, ClientError> {
        loop {
            let idle = self.idle.notified();
            let exchange = self.exchange().await?;
            let awaiting = exchange.session.awaiting_replies;
            if awaiting == 0 {
                return Ok(exchange);
            }
            tracing::debug!("Waiting for {} outstanding response(s)", awaiting);
            exchange.complete();
            idle.await;
        }
    }

    async fn with_timeout<T, F>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match self.config.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, operation).await.map_err(|_| {
                tracing::debug!("Request timed out after {:?}", limit);
                ClientError::Timeout
            })?,
            None => operation.await,
        }
    }

    async fn write_query(
        &self,
        link: &mut Link,
        kind: MessageKind,
        expression: &C::Value,
        parameters: &[C::Value],
        options: &Options,
    ) -> Result<(), ClientError> {
        if parameters.len() > MAX_PARAMETERS {
            return Err(ProtocolError::TooManyParameters {
                count: parameters.len(),
                max: MAX_PARAMETERS,
            }
            .into());
        }

        let options = self.config.options.merged(options);
        tracing::debug!(
            "Sending {} query with {} parameter(s)",
            kind,
            parameters.len()
        );
        if parameters.is_empty() {
            link.writer
                .write(&self.codec, expression, kind, &options)
                .await?;
        } else {
            link.writer
                .write_call(&self.codec, expression, parameters, kind, &options)
                .await?;
        }
        Ok(())
    }

    async fn round_trip(
        &self,
        link: &mut Link,
        expression: &C::Value,
        parameters: &[C::Value],
        options: &Options,
    ) -> Result<Payload<C::Value>, ClientError> {
        self.write_query(link, MessageKind::Sync, expression, parameters, options)
            .await?;

        let options = self.config.options.merged(options);
        let message = link.reader.read(&self.codec, &options).await?;
        match message.kind {
            MessageKind::Response => Ok(message.payload),
            kind => Err(self.reject(link, kind).await),
        }
    }

    /// Answers an unexpected message with an exception value.
    async fn reject(&self, link: &mut Link, kind: MessageKind) -> ClientError {
        let reply_kind = match kind {
            MessageKind::Async => MessageKind::Async,
            _ => MessageKind::Response,
        };
        tracing::warn!("Expected RESPONSE, received {}; notifying peer", kind);

        let exception = self
            .codec
            .exception(UNEXPECTED_MESSAGE_TEXT, &link.writer.encode_context());
        match link
            .writer
            .write(&self.codec, &exception, reply_kind, &Options::new())
            .await
        {
            Ok(_) => ClientError::UnexpectedMessage { kind },
            Err(e) => {
                tracing::warn!("Failed to notify peer: {}", e);
                ClientError::NotifyFailed {
                    kind,
                    source: Box::new(e),
                }
            }
        }
    }
}

/// Runs `work` unless `close` retires link `generation` first.
async fn unless_retired<F: Future>(
    retired: &mut watch::Receiver<u64>,
    generation: u64,
    work: F,
) -> Result<F::Output, ClientError> {
    tokio::select! {
        output = work => Ok(output),
        _ = wait_retired(retired, generation) => {
            tracing::debug!("Operation interrupted by close");
            Err(ClientError::NotConnected)
        }
    }
}

async fn wait_retired(retired: &mut watch::Receiver<u64>, generation: u64) {
    while *retired.borrow_and_update() < generation {
        if retired.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Exclusive use of the link for one operation.
///
/// Dropped without [`complete`](Exchange::complete), it tears the link down:
/// the interrupted operation may have left a partial frame on the stream.
struct Exchange<'a> {
    session: MutexGuard<'a, Session>,
    connected: &'a AtomicBool,
    idle: &'a Notify,
    retired: watch::Receiver<u64>,
    armed: bool,
}

impl Exchange<'_> {
    fn parts(&mut self) -> Result<(&mut Link, &mut watch::Receiver<u64>), ClientError> {
        let link = self.session.link.as_mut().ok_or(ClientError::NotConnected)?;
        Ok((link, &mut self.retired))
    }

    fn reply_read(&mut self) {
        if self.session.awaiting_replies == 0 {
            return;
        }
        self.session.awaiting_replies -= 1;
        if self.session.awaiting_replies == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Releases the link, keeping it only if `result` left the stream on a
    /// frame boundary.
    fn finish<T>(self, result: &Result<T, ClientError>) {
        match result {
            Err(e) if e.requires_reopen() => {
                tracing::warn!("Stream out of step after error: {}", e);
            }
            _ => self.complete(),
        }
    }

    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.session.link.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            tracing::warn!("Operation interrupted mid-exchange; connection closed");
        }
        self.session.awaiting_replies = 0;
        self.idle.notify_waiters();
    }
}
