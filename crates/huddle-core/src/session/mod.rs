//! Peer session negotiation.
//!
//! One [`PeerSession`] per remote peer, owned by a dedicated actor task and
//! reached through the [`PeerSessionManager`].

mod actor;
pub mod manager;
pub mod peer;
pub mod state;

pub use manager::PeerSessionManager;
pub use peer::PeerSession;
pub use state::{SessionState, should_initiate};
