//! Error types for the Switchyard channel client

use thiserror::Error;

/// Result type alias for channel client operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in socket and channel operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelError {
    /// Opening the transport failed (network or handshake)
    #[error("Connect error: {0}")]
    Connect(String),

    /// An inbound frame could not be decoded into an envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// The server refused a join request
    #[error("Join error: {0}")]
    Join(String),

    /// A frame could not be handed to the transport
    #[error("Send error: {0}")]
    Send(String),

    /// No reply arrived before the request deadline
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The transport closed while the request was in flight
    #[error("Connection lost before a reply arrived")]
    ConnectionLost,

    /// The socket was disconnected by the caller
    #[error("Request cancelled by disconnect")]
    Cancelled,

    /// The operation is not valid in the channel's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The socket event loop is no longer running
    #[error("Socket has shut down")]
    Shutdown,
}

impl ChannelError {
    /// Create a connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a join error
    pub fn join(reason: impl Into<String>) -> Self {
        Self::Join(reason.into())
    }

    /// Create a send error
    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the failure is tied to the transport going away rather than
    /// to the request itself.
    pub const fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Send(_) | Self::ConnectionLost | Self::Shutdown
        )
    }
}

impl From<crate::config::ConfigError> for ChannelError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
