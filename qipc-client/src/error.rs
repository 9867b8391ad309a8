//! Client error types.

use qipc_protocol::{BoxError, MessageKind, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection is not established")]
    NotConnected,

    #[error("host is not set")]
    MissingHost,

    #[error("connection denied: handshake rejected")]
    AuthenticationFailed,

    #[error("timed out")]
    Timeout,

    #[error("received {kind} message where a response was expected")]
    UnexpectedMessage { kind: MessageKind },

    #[error("received {kind} message where a response was expected; notifying peer failed")]
    NotifyFailed {
        kind: MessageKind,
        #[source]
        source: Box<ClientError>,
    },

    #[error("codec error: {0}")]
    Codec(#[source] BoxError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("cannot read config {0}: {1}")]
    ConfigIo(PathBuf, #[source] std::io::Error),

    #[error("invalid config {0}: {1}")]
    ConfigParse(PathBuf, String),
}

impl ClientError {
    pub(crate) fn codec(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        ClientError::Codec(Box::new(err))
    }

    /// For an unexpected-message error, whether the peer was told about it.
    pub fn peer_notified(&self) -> Option<bool> {
        match self {
            ClientError::UnexpectedMessage { .. } => Some(true),
            ClientError::NotifyFailed { .. } => Some(false),
            _ => None,
        }
    }

    /// Returns whether the connection must be reopened before further use.
    ///
    /// I/O failures mid-frame count: the stream no longer sits on a frame
    /// boundary.
    pub fn requires_reopen(&self) -> bool {
        match self {
            ClientError::NotConnected
            | ClientError::AuthenticationFailed
            | ClientError::Timeout
            | ClientError::Io(_)
            | ClientError::Protocol(ProtocolError::Io(_))
            | ClientError::Protocol(ProtocolError::UnexpectedEof { .. }) => true,
            ClientError::NotifyFailed { source, .. } => source.requires_reopen(),
            _ => false,
        }
    }
}
