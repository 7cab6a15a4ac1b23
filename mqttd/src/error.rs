//! Error types for mqttd.

use std::io;

/// Result type alias for mqttd.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttd operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid topic filter.
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    /// Certificate file could not be read or parsed.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key file could not be read or parsed.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// PEM file held no usable certificate.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// PEM file held no usable private key.
    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    /// rustls rejected the configuration (for example a cert/key mismatch).
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// YAML document could not be parsed or written.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Config file could not be parsed.
    #[error("invalid config file '{path}': {message}")]
    ConfigFile { path: String, message: String },

    /// A listener could not bind its address.
    #[error("listener {id} failed to bind {addr}: {source}")]
    Bind {
        id: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Server or broker is already running.
    #[error("already running")]
    AlreadyRunning,

    /// Server is not running.
    #[error("not running")]
    NotRunning,

    /// Server or broker is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Inline publish/subscribe requested while the inline client is off.
    #[error("inline client disabled")]
    InlineClientDisabled,
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
