//! Error types for the realtime voice client.

use thiserror::Error;

/// Result type alias for realtime voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the realtime voice client
#[derive(Debug, Error)]
pub enum Error {
    /// Handshake/auth failure, or a send attempted while the connection is not open
    #[error("connection error: {0}")]
    Connection(String),

    /// Unclean close while the connection was open
    #[error("transport dropped (code {code:?}): {reason}")]
    TransportDrop { code: Option<u16>, reason: String },

    /// Automatic reconnection gave up
    #[error("reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Remote-reported error event or malformed inbound payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio capture failure
    #[error("device error: {0}")]
    Device(String),

    /// Malformed codec input
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Copyable discriminant of [`Error`], used by event sinks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    TransportDrop,
    ReconnectExhausted,
    Protocol,
    Device,
    Codec,
    Config,
    Io,
    Serialization,
    Toml,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::TransportDrop { .. } => ErrorKind::TransportDrop,
            Self::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Device(_) => ErrorKind::Device,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Toml(_) => ErrorKind::Toml,
        }
    }

    /// Whether the UI collaborator should see this error.
    ///
    /// Transport drops are handled locally until reconnection is exhausted.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ReconnectExhausted
                | ErrorKind::Protocol
                | ErrorKind::Device
                | ErrorKind::Connection
        )
    }
}
