//! Session state machine and glare resolution.
//!
//! ```text
//!            ┌──────────────── offer/answer ─────────────────┐
//!            ▼                                               │
//! (absent) ─▶ Connecting ─▶ Connected ◀──▶ Renegotiating     │
//!                 │             │                            │
//!                 ▼             ▼                            │
//!              Failed ◀──── Disconnected ── reconnect ───────┘
//!                 │
//!                 ▼
//!              Closed
//! ```

use std::fmt;

/// Lifecycle state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Negotiating a new connection
    Connecting,
    /// Established
    Connected,
    /// Established, exchanging a new offer/answer round
    Renegotiating,
    /// Connectivity lost, waiting to self-heal
    Disconnected,
    /// Connectivity lost for good, reconnect pending or exhausted
    Failed,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether data can flow
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Renegotiating)
    }

    /// Whether the connection is broken, so an incoming offer starts over
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Renegotiating => write!(f, "renegotiating"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Whether the local side sends the initial offer to `remote`
///
/// Only the side whose id sorts lexicographically greater initiates; the
/// other side waits for its offer. The same rule decides who reconnects a
/// broken session.
pub fn should_initiate(local: &str, remote: &str) -> bool {
    local > remote
}
