//! Integration test support for HUDDLE
//!
//! Fixtures that stand up a relay, lobby members and transfer engines in
//! one process, plus timing helpers that tolerate slow CI machines.

pub mod fixtures;
