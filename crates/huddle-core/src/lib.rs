//! # HUDDLE Core
//!
//! Peer-to-peer sessions and file transfers between members of a lobby.
//!
//! This crate provides:
//! - Per-peer session negotiation with glare resolution, candidate queueing,
//!   renegotiation and glare-gated reconnection
//! - Data channel transport with backpressure and a binary transfer framing
//! - Chunked parallel downloads with a global admission queue
//! - The [`Lobby`] orchestrator tying signaling, sessions and transfers
//! - An in-memory peer link backend for tests and loopback runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Lobby                                 │
//! │   (signaling client, roster, chat, shares, local microphone)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    PeerSessionManager                           │
//! │   (one actor per peer: offer/answer, ICE, reconnect, heartbeat) │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   DataChannelTransport                          │
//! │   (control: ordered JSON, file-transfer: unordered frames)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  ChunkedTransferEngine                          │
//! │   (range threads, reassembly, admission queue, progress)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Peer connections themselves are supplied through the
//! [`PeerConnector`](link::PeerConnector) trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod frame;
pub mod link;
pub mod lobby;
pub mod media;
pub mod memory;
pub mod session;
pub mod transfer;

pub use channel::DataChannelTransport;
pub use config::{ChannelConfig, LobbyConfig, SessionConfig, TransferConfig};
pub use control::{ControlMessage, TransferRequest};
pub use error::{ChannelError, Error, FrameError, Result};
pub use events::{ChannelEvent, LobbyEvent, ShareChange};
pub use frame::{FrameType, TransferFrame};
pub use link::{
    ChannelState, DataChannel, LinkEvent, LinkState, PeerConnector, PeerId, PeerLink, SdpKind,
};
pub use lobby::Lobby;
pub use media::{AudioTrack, MediaSource, SilentSource, SilentTrack};
pub use memory::MemoryNetwork;
pub use session::{PeerSession, PeerSessionManager, SessionState, should_initiate};
pub use transfer::{
    ChunkedTransferEngine, FileDescriptor, ShareAccess, ThreadCompletionTracker,
    TransferProgress, TransferStatus, TransportProvider,
};
