//! Events published by the lobby.

use crate::control::ControlMessage;
use crate::link::PeerId;
use crate::media::AudioTrack;
use crate::session::SessionState;
use huddle_signaling::{ChatMessage, PeerInfo, ShareInfo};
use std::sync::Arc;

/// Kind of share catalog change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareChange {
    /// Share published
    Added,
    /// Share withdrawn
    Removed,
    /// Share metadata changed
    Updated,
}

/// Roster, session and lobby events, write-only from the core
#[derive(Debug, Clone)]
pub enum LobbyEvent {
    /// A member joined (or was listed in the roster snapshot)
    PeerJoined(PeerInfo),
    /// A member left and its session was torn down
    PeerLeft {
        /// Member id
        peer_id: PeerId,
    },
    /// A member's microphone state changed
    PeerStatus {
        /// Member id
        peer_id: PeerId,
        /// Whether the microphone is live
        mic_enabled: bool,
    },
    /// A peer session changed state
    SessionState {
        /// Member id
        peer_id: PeerId,
        /// New state
        state: SessionState,
    },
    /// Remote audio arrived from a peer
    RemoteStream {
        /// Member id
        peer_id: PeerId,
        /// The remote track
        track: Arc<dyn AudioTrack>,
    },
    /// Nothing heard from a connected peer for longer than the heartbeat timeout
    PeerStale {
        /// Member id
        peer_id: PeerId,
    },
    /// A broken session used up its reconnect attempts
    ReconnectExhausted {
        /// Member id
        peer_id: PeerId,
        /// Attempts made
        attempts: u32,
    },
    /// Lobby chat
    Chat(ChatMessage),
    /// Share catalog change
    Share {
        /// What happened
        change: ShareChange,
        /// Catalog entry
        share: ShareInfo,
    },
    /// Registration was refused (the connection stays open)
    RegistrationFailed {
        /// Server reason
        message: String,
    },
    /// This build is too old for the server; signaling has stopped
    VersionError {
        /// Version this client reported
        current: String,
        /// Minimum accepted version
        minimum: String,
        /// Upgrade location
        download_url: Option<String>,
    },
    /// Signaling dropped and is retrying
    SignalingReconnecting {
        /// Attempt number
        attempt: u32,
    },
    /// Signaling came back
    SignalingRestored,
    /// Signaling stopped for good
    SignalingLost,
}

/// Inbound data channel traffic handed to the transfer engine
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Transfer-related control message
    Control {
        /// Sender
        peer_id: PeerId,
        /// Message
        message: ControlMessage,
    },
    /// Raw transfer frame
    Frame {
        /// Sender
        peer_id: PeerId,
        /// Encoded frame
        data: Vec<u8>,
    },
}
