//! Reusable multi-peer fixtures

mod two_peer;

pub use two_peer::{
    EnginePair, GatedStore, LOBBY, Member, ReadGate, SHARE_ROOT, TwoPeerFixture, descriptor,
    fast_session, member_config,
};
