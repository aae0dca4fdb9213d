//! Error types for HUDDLE sessions and transfers
//!
//! Errors are classified so callers can decide between retrying and
//! reporting:
//!
//! - **Transient**: a channel was momentarily closed, a negotiation step
//!   timed out, the signaling socket dropped.
//! - **Permanent**: bad configuration, unknown transfer, malformed frame,
//!   incompatible client version.
//!
//! Failures are always scoped to the smallest affected unit (one thread,
//! one transfer, one peer session); nothing here aborts the process.

use huddle_files::FileError;
use huddle_signaling::SignalingError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by a data channel send
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel is not in the open state
    #[error("Channel '{0}' is not open")]
    NotOpen(String),

    /// Underlying send failed
    #[error("Channel send failed: {0}")]
    Send(String),

    /// Message could not be encoded
    #[error("Channel encode failed: {0}")]
    Encode(String),
}

/// Errors raised while decoding a transfer frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the header announces
    #[error("Frame truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Unknown frame type code
    #[error("Unknown frame type {0}")]
    UnknownType(u32),

    /// Request id is not valid UTF-8
    #[error("Frame id is not valid UTF-8")]
    InvalidId,

    /// Error frame message is not valid UTF-8
    #[error("Frame message is not valid UTF-8")]
    InvalidMessage,
}

/// Errors raised by peer sessions and transfers
#[derive(Debug, Error, Clone)]
pub enum Error {
    // ============ Session Errors ============
    /// Offer/answer or candidate exchange failed
    #[error("Negotiation failed: {0}")]
    Negotiation(Cow<'static, str>),

    /// No session exists for the peer
    #[error("No session for peer {0}")]
    SessionNotFound(String),

    /// Signaling failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    // ============ Channel Errors ============
    /// Data channel failure
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Malformed transfer frame
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    // ============ Transfer Errors ============
    /// One transfer thread failed, which fails the whole transfer
    #[error("Transfer thread failed: {0}")]
    ThreadTransfer(String),

    /// Transfer id is unknown (finished, cancelled or never existed)
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Transfer was cancelled
    #[error("Transfer cancelled")]
    Cancelled,

    // ============ I/O Errors ============
    /// File store failure
    #[error("File error: {0}")]
    Io(#[from] FileError),

    // ============ Configuration & Operational Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Internal task or channel has shut down
    #[error("Shut down: {0}")]
    Shutdown(Cow<'static, str>),
}

impl Error {
    /// Create a negotiation error with a static message
    pub const fn negotiation(msg: &'static str) -> Self {
        Self::Negotiation(Cow::Borrowed(msg))
    }

    /// Create a timeout error with a static message
    pub const fn timeout(msg: &'static str) -> Self {
        Self::Timeout(Cow::Borrowed(msg))
    }

    /// Create an invalid configuration error with a static message
    pub const fn invalid_config(msg: &'static str) -> Self {
        Self::InvalidConfig(Cow::Borrowed(msg))
    }

    /// Returns true if this error is transient and may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Negotiation(_) | Error::Timeout(_) | Error::ThreadTransfer(_) => true,
            Error::Channel(ChannelError::NotOpen(_) | ChannelError::Send(_)) => true,
            Error::Signaling(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Returns true if this error is permanent and needs intervention
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Channel(ChannelError::Encode(e.to_string()))
    }
}

/// Result type for HUDDLE core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::negotiation("offer").is_transient());
        assert!(Error::Channel(ChannelError::NotOpen("files".into())).is_transient());
        assert!(Error::Cancelled.is_permanent());
        assert!(Error::invalid_config("threads").is_permanent());
        assert!(Error::Frame(FrameError::UnknownType(9)).is_permanent());
    }

    #[test]
    fn test_signaling_classification_follows_source() {
        let fatal = Error::from(SignalingError::VersionTooOld {
            current: "0.1.0".into(),
            minimum: "0.2.0".into(),
            download_url: None,
        });
        assert!(fatal.is_permanent());

        let dropped = Error::from(SignalingError::Closed);
        assert!(dropped.is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::TransferNotFound("transfer-42".to_string());
        assert_eq!(err.to_string(), "Transfer not found: transfer-42");

        let err = Error::from(FrameError::Truncated { needed: 8, actual: 3 });
        assert!(err.to_string().contains("need 8 bytes"));
    }
}
