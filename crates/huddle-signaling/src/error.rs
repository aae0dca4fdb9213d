//! Error types for lobby signaling
//!
//! Errors fall into two groups that drive reconnection:
//!
//! - **Recoverable**: the socket dropped, a registration was refused, or a
//!   request timed out. The client may retry or reconnect.
//! - **Fatal**: the server declared this build too old. Reconnection stops
//!   until the user upgrades.

use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the signaling client and relay
#[derive(Debug, Error, Clone)]
pub enum SignalingError {
    /// Could not open the WebSocket
    #[error("Connection failed: {0}")]
    Connect(Cow<'static, str>),

    /// Server refused the registration (bad lobby, wrong password, duplicate id)
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Server requires a newer client build
    #[error("Client version {current} is too old (minimum {minimum})")]
    VersionTooOld {
        /// Version this client reported
        current: String,
        /// Minimum accepted version
        minimum: String,
        /// Upgrade location, if the server provided one
        download_url: Option<String>,
    },

    /// Connection is closed
    #[error("Signaling connection closed")]
    Closed,

    /// Operation requires a completed registration
    #[error("Not registered with signaling server")]
    NotRegistered,

    /// Request timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Malformed or unknown message
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// All reconnection attempts were used up
    #[error("Reconnection gave up after {0} attempts")]
    ReconnectExhausted(u32),

    /// Server URL could not be parsed
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

impl SignalingError {
    /// Create a timeout error with a static message
    pub const fn timeout(msg: &'static str) -> Self {
        Self::Timeout(Cow::Borrowed(msg))
    }

    /// Create a connect error with a static message
    pub const fn connect(msg: &'static str) -> Self {
        Self::Connect(Cow::Borrowed(msg))
    }

    /// Returns true if the client must not reconnect after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SignalingError::VersionTooOld { .. }
                | SignalingError::InvalidUrl(_)
                | SignalingError::ReconnectExhausted(_)
        )
    }

    /// Returns true if the error leaves the client able to retry
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Returns true if the failure was on the socket rather than a server decision
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SignalingError::Connect(_) | SignalingError::Closed | SignalingError::Io(_)
        )
    }
}

impl From<std::io::Error> for SignalingError {
    fn from(e: std::io::Error) -> Self {
        SignalingError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SignalingError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SignalingError::Closed,
            WsError::Io(io) => SignalingError::Io(io.to_string()),
            WsError::Url(url) => SignalingError::InvalidUrl(url.to_string()),
            other => SignalingError::Connect(Cow::Owned(other.to_string())),
        }
    }
}

impl From<url::ParseError> for SignalingError {
    fn from(e: url::ParseError) -> Self {
        SignalingError::InvalidUrl(e.to_string())
    }
}

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SignalingError>;
