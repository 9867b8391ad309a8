//! Credential and protocol-version handshake.
//!
//! The client offers its maximum protocol version after the credentials.
//! Peers that predate version negotiation drop the socket without replying;
//! for those the client reconnects once and sends the legacy frame, which
//! carries no version byte. A second silent close rejects the handshake.

use crate::error::ClientError;
use qipc_protocol::MAX_PROTOCOL_VERSION;
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    /// Credentials sent with a version offer.
    CredentialsSent,
    /// Credentials resent in the legacy format.
    Retrying,
    Negotiated(u8),
    Rejected,
}

/// Credentials followed by the version offer and a terminator.
pub fn offer_frame(token: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(token.len() + 2);
    frame.extend_from_slice(token);
    frame.extend_from_slice(&[MAX_PROTOCOL_VERSION, 0]);
    frame
}

/// Credentials followed by the terminator only.
pub fn legacy_frame(token: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(token.len() + 1);
    frame.extend_from_slice(token);
    frame.push(0);
    frame
}

/// Runs the handshake, returning the negotiated stream and protocol version.
///
/// `connect` is called once per attempt; at most two transports are opened.
/// Every transport that does not end in `Negotiated` is shut down before
/// this returns.
pub(crate) async fn negotiate<S, F, Fut>(
    mut connect: F,
    token: &[u8],
) -> Result<(S, u8), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, ClientError>>,
{
    let mut stream = connect().await?;
    let mut state = HandshakeState::Disconnected;

    loop {
        state = match state {
            HandshakeState::Disconnected => {
                tracing::debug!("Sending credentials (offering protocol v{})", MAX_PROTOCOL_VERSION);
                send(&mut stream, &offer_frame(token)).await?;
                HandshakeState::CredentialsSent
            }
            HandshakeState::CredentialsSent => match read_version(&mut stream).await? {
                Some(version) => HandshakeState::Negotiated(version),
                None => {
                    tracing::debug!("Peer closed without a version; retrying with legacy handshake");
                    abandon(&mut stream).await;
                    stream = connect().await?;
                    send(&mut stream, &legacy_frame(token)).await?;
                    HandshakeState::Retrying
                }
            },
            HandshakeState::Retrying => match read_version(&mut stream).await? {
                Some(version) => HandshakeState::Negotiated(version),
                None => HandshakeState::Rejected,
            },
            HandshakeState::Negotiated(version) => {
                let negotiated = version.min(MAX_PROTOCOL_VERSION);
                tracing::debug!(
                    "Handshake complete: peer v{}, using v{}",
                    version,
                    negotiated
                );
                return Ok((stream, negotiated));
            }
            HandshakeState::Rejected => {
                tracing::warn!("Handshake rejected by peer");
                abandon(&mut stream).await;
                return Err(ClientError::AuthenticationFailed);
            }
        };
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> Result<(), ClientError> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Shuts down a transport the handshake gives up on. Failures are logged only.
async fn abandon<S: AsyncWrite + Unpin>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        tracing::debug!("Shutdown failed: {}", e);
    }
}

/// Reads the one-byte reply; `None` means the peer closed instead.
async fn read_version<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<u8>, ClientError> {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf).await {
        Ok(1) => Ok(Some(buf[0])),
        Ok(_) => Ok(None),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) =>
        {
            tracing::debug!("Peer reset during handshake: {}", e);
            Ok(None)
        }
        Err(e) => Err(ClientError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_test::io::{Builder, Mock};

    const TOKEN: &[u8] = b"user:pass";

    /// Connects to scripted mocks in order, counting attempts.
    fn scripted(
        mocks: Vec<Mock>,
    ) -> (
        impl FnMut() -> std::future::Ready<Result<Mock, ClientError>>,
        Arc<AtomicUsize>,
    ) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut queue: VecDeque<Mock> = mocks.into();
        let connect = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(queue.pop_front().ok_or(ClientError::NotConnected))
        };
        (connect, attempts)
    }

    #[test]
    fn test_frames() {
        assert_eq!(offer_frame(b"a:b"), b"a:b\x06\x00".to_vec());
        assert_eq!(legacy_frame(b"a:b"), b"a:b\x00".to_vec());
        assert_eq!(offer_frame(b""), vec![MAX_PROTOCOL_VERSION, 0]);
    }

    #[tokio::test]
    async fn test_negotiated_version() {
        let mock = Builder::new().write(&offer_frame(TOKEN)).read(&[3]).build();
        let (connect, attempts) = scripted(vec![mock]);

        let (_stream, version) = negotiate(connect, TOKEN).await.unwrap();
        assert_eq!(version, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_version_capped_at_client_max() {
        let mock = Builder::new().write(&offer_frame(TOKEN)).read(&[9]).build();
        let (connect, _) = scripted(vec![mock]);

        let (_stream, version) = negotiate(connect, TOKEN).await.unwrap();
        assert_eq!(version, MAX_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_legacy_fallback() {
        let first = Builder::new().write(&offer_frame(TOKEN)).build();
        let second = Builder::new().write(&legacy_frame(TOKEN)).read(&[1]).build();
        let (connect, attempts) = scripted(vec![first, second]);

        let (_stream, version) = negotiate(connect, TOKEN).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_counts_as_close() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let first = Builder::new()
            .write(&offer_frame(TOKEN))
            .read_error(reset)
            .build();
        let second = Builder::new().write(&legacy_frame(TOKEN)).read(&[2]).build();
        let (connect, _) = scripted(vec![first, second]);

        let (_stream, version) = negotiate(connect, TOKEN).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_rejected_after_one_retry() {
        let first = Builder::new().write(&offer_frame(TOKEN)).build();
        let second = Builder::new().write(&legacy_frame(TOKEN)).build();
        let (connect, attempts) = scripted(vec![first, second]);

        let result = negotiate(connect, TOKEN).await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (connect, _) = scripted(vec![]);
        let result: Result<(Mock, u8), _> = negotiate(connect, TOKEN).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    /// A transport whose shutdown always fails.
    struct StuckShutdown(Mock);

    impl AsyncRead for StuckShutdown {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for StuckShutdown {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        }
    }

    #[tokio::test]
    async fn test_failed_shutdown_does_not_abort_handshake() {
        let mut mocks = VecDeque::from([
            Builder::new().write(&offer_frame(TOKEN)).build(),
            Builder::new().write(&legacy_frame(TOKEN)).read(&[1]).build(),
        ]);
        let connect = move || {
            std::future::ready(
                mocks
                    .pop_front()
                    .map(StuckShutdown)
                    .ok_or(ClientError::NotConnected),
            )
        };
        let (_stream, version) = negotiate(connect, TOKEN).await.unwrap();
        assert_eq!(version, 1);

        let mut mocks = VecDeque::from([
            Builder::new().write(&offer_frame(TOKEN)).build(),
            Builder::new().write(&legacy_frame(TOKEN)).build(),
        ]);
        let connect = move || {
            std::future::ready(
                mocks
                    .pop_front()
                    .map(StuckShutdown)
                    .ok_or(ClientError::NotConnected),
            )
        };
        let result = negotiate(connect, TOKEN).await;
        assert!(matches!(result, Err(ClientError::AuthenticationFailed)));
    }
}
