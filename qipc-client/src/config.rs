//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via QIPC_CONFIG)
//! 3. Environment variables

use crate::error::ClientError;
use qipc_protocol::{Options, TextEncoding, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web PKI roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Server name for SNI (defaults to the host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Service host name or address.
    pub host: Option<String>,
    /// Service port.
    pub port: u16,
    /// Username for the handshake.
    pub username: Option<String>,
    /// Password for the handshake.
    pub password: Option<String>,
    /// Encoding of credentials and character data.
    pub encoding: TextEncoding,
    /// Timeout for establishing the transport, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Timeout for one request cycle, in milliseconds. Expiry closes the
    /// connection.
    pub request_timeout_ms: Option<u64>,
    /// Options applied to every call unless overridden.
    pub options: Options,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            encoding: TextEncoding::Latin1,
            connect_timeout_ms: 10_000,
            request_timeout_ms: None,
            options: Options::default(),
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// The handshake token `"<username>:<password>"`.
    pub fn credentials(&self) -> String {
        format!(
            "{}:{}",
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or("")
        )
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ClientError> {
        let mut config = match std::env::var("QIPC_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::ConfigIo(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ClientError::ConfigParse(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("QIPC_HOST") {
            self.host = Some(host);
        }
        if let Ok(port) = std::env::var("QIPC_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
        if let Ok(user) = std::env::var("QIPC_USER") {
            self.username = Some(user);
        }
        if let Ok(password) = std::env::var("QIPC_PASSWORD") {
            self.password = Some(password);
        }
    }
}
