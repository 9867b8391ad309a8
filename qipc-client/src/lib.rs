//! # qipc-client
//!
//! Async client for q IPC services.
//!
//! This crate provides:
//! - The credential handshake with version negotiation and legacy fallback
//! - Frame reading (including compressed payloads) and frame writing
//! - A connection with serialized sync/async dispatch
//! - Optional TLS support

pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod reader;
pub mod stream;
pub mod tls;
pub mod writer;

pub use config::{ConnectionConfig, TlsClientConfig};
pub use connection::Connection;
pub use error::ClientError;
pub use handshake::HandshakeState;
pub use reader::FrameReader;
pub use stream::IpcStream;
pub use writer::FrameWriter;
