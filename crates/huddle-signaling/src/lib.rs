//! # HUDDLE Signaling
//!
//! Lobby signaling for the HUDDLE peer-to-peer voice and file sharing system.
//!
//! Signaling only ever carries connection-setup metadata (roster, session
//! descriptions, ICE candidates, status and chat events). Media and file bytes
//! travel over direct peer links negotiated with its help.
//!
//! This crate provides:
//! - The JSON wire protocol ([`protocol::SignalMessage`])
//! - A persistent client with backoff-gated reconnection ([`client::SignalingClient`])
//! - A lobby relay server that routes messages between members ([`server::RelayServer`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   register / offer / answer / ice   ┌──────────────┐
//! │   Client A   │ ───────────────────────────────────▶│              │
//! │              │◀─────────────────────────────────── │ RelayServer  │
//! └──────────────┘   players-list / joined / routed    │  (lobby)     │
//! ┌──────────────┐                                     │              │
//! │   Client B   │ ◀──────────────────────────────────▶│              │
//! └──────────────┘                                     └──────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use backoff::ReconnectPolicy;
pub use client::{ConnectionState, SignalSink, SignalingClient, SignalingConfig, SignalingEvent};
pub use error::{Result, SignalingError};
pub use protocol::{
    ChatMessage, IceCandidateInit, Identity, PeerInfo, RegisterMetadata, ShareInfo, SignalMessage,
};
pub use server::{RelayConfig, RelayServer};

/// Version string advertised by this build in registration metadata.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
