//! Transport: plain TCP or TLS.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::tls::create_tls_connector;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// A duplex byte stream to the service.
    #[project = IpcStreamProj]
    pub enum IpcStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl IpcStream {
    /// Establishes the transport described by `config`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ClientError> {
        let host = config.host.as_deref().ok_or(ClientError::MissingHost)?;
        tracing::debug!("Connecting to {}:{}...", host, config.port);

        let tcp_stream = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect((host, config.port)),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        match config.tls {
            Some(ref tls_config) if tls_config.enabled => {
                let (connector, server_name) = create_tls_connector(tls_config, host)?;
                tracing::debug!("Performing TLS handshake...");
                let stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                tracing::debug!("TLS handshake complete");
                Ok(IpcStream::Tls { stream })
            }
            _ => Ok(IpcStream::Plain { stream: tcp_stream }),
        }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, IpcStream::Tls { .. })
    }
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            IpcStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            IpcStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            IpcStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            IpcStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            IpcStreamProj::Plain { stream } => stream.poll_flush(cx),
            IpcStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            IpcStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            IpcStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
