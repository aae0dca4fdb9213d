//! Peer connection capability.
//!
//! A [`PeerLink`] is one browser-style peer connection: it produces and
//! consumes session descriptions, accepts trickled ICE candidates, carries
//! one outgoing audio track and exposes two data channels. NAT traversal and
//! media transport are the implementation's business; sessions only drive
//! the negotiation.
//!
//! Everything the link observes is reported as a [`LinkEvent`] on the
//! channel handed to [`PeerConnector::create_link`].

use crate::error::{ChannelError, Result};
use crate::media::AudioTrack;
use async_trait::async_trait;
use huddle_signaling::IceCandidateInit;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Remote peer identifier (the lobby member id)
pub type PeerId = String;

/// Label of the ordered control channel
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Label of the unordered transfer channel
pub const TRANSFER_CHANNEL_LABEL: &str = "file-transfer";

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Connectivity state reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing negotiated
    New,
    /// Checking candidates
    Connecting,
    /// Media and data can flow
    Connected,
    /// Connectivity lost, may recover on its own
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally
    Closed,
}

/// Ready state of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not yet open
    Connecting,
    /// Open for sending
    Open,
    /// Shutting down
    Closing,
    /// Closed
    Closed,
}

/// Event observed on a link
#[derive(Clone)]
pub enum LinkEvent {
    /// Connectivity changed
    StateChanged(LinkState),
    /// Local ICE candidate ready to be signaled
    LocalCandidate(IceCandidateInit),
    /// Remote audio track arrived
    RemoteTrack(Arc<dyn AudioTrack>),
    /// Message on the control channel
    ControlMessage(Vec<u8>),
    /// Frame on the transfer channel
    TransferFrame(Vec<u8>),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(&c.candidate).finish(),
            Self::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.id()).finish(),
            Self::ControlMessage(b) => write!(f, "ControlMessage({} bytes)", b.len()),
            Self::TransferFrame(b) => write!(f, "TransferFrame({} bytes)", b.len()),
        }
    }
}

/// One data channel on a link
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Current ready state
    fn ready_state(&self) -> ChannelState;

    /// Bytes queued for sending but not yet on the wire
    fn buffered_amount(&self) -> usize;

    /// Queue a message
    async fn send(&self, data: Vec<u8>) -> std::result::Result<(), ChannelError>;
}

/// A peer connection handle
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Create an answer to the applied remote offer and install it
    async fn create_answer(&self) -> Result<String>;

    /// Apply the remote description
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    /// Apply a remote ICE candidate (requires a remote description)
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Replace the outgoing audio track (`None` detaches it)
    async fn replace_audio_track(&self, track: Option<Arc<dyn AudioTrack>>) -> Result<()>;

    /// Ordered, reliable control channel
    fn control_channel(&self) -> Arc<dyn DataChannel>;

    /// Unordered, short-lifetime transfer channel
    fn transfer_channel(&self) -> Arc<dyn DataChannel>;

    /// Current connectivity
    fn state(&self) -> LinkState;

    /// Tear the connection down
    async fn close(&self);
}

/// Factory for peer links
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a link from `local` to `remote`, reporting events on `events`
    async fn create_link(
        &self,
        local: &str,
        remote: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}
