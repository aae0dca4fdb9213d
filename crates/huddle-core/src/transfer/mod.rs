//! Chunked parallel file transfers.
//!
//! A download is split into byte ranges, one thread per range. Each thread
//! is requested separately over the owner's control channel and streamed
//! back as [`TransferFrame`](crate::frame::TransferFrame)s on the transfer
//! channel:
//!
//! ```text
//! Requester                                   Owner
//!     |-- transfer-request (thread 0) ----------->|
//!     |-- transfer-request (thread 1) ----------->|
//!     |                                           |
//!     |<-- chunk (thread 1, 0/2) -----------------|
//!     |<-- chunk (thread 0, 0/1) -----------------|
//!     |<-- complete (thread 0, 1) ----------------|
//!     |<-- chunk (thread 1, 1/2) -----------------|
//!     |<-- complete (thread 1, 2) ----------------|
//!     |                                           |
//!     |  [merge threads 0..n, write save path]    |
//! ```
//!
//! Thread request ids are `<request id>-thread-<n>`.

pub mod admission;
pub mod engine;
pub mod progress;
pub mod share;
pub mod tracker;

pub use admission::{AdmissionPermit, AdmissionQueue};
pub use engine::ChunkedTransferEngine;
pub use progress::{TransferProgress, TransferStatus};
pub use share::ShareAccess;
pub use tracker::{ThreadCompletionTracker, TrackerOutcome};

use crate::channel::DataChannelTransport;
use serde::{Deserialize, Serialize};

/// What a requester knows about a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Share the file belongs to
    pub share_id: String,
    /// Peer serving the file
    pub owner_id: String,
    /// Path relative to the share root
    pub path: String,
    /// File name for display
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    /// Password for a protected share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Source of established data channels, keyed by peer
pub trait TransportProvider: Send + Sync {
    /// Transport for `peer_id`, if a session is connected
    fn transport(&self, peer_id: &str) -> Option<DataChannelTransport>;
}

/// Id of thread `thread` of `request_id`
pub fn thread_request_id(request_id: &str, thread: usize) -> String {
    format!("{request_id}-thread-{thread}")
}

/// Split a thread request id into its request id and thread index
pub fn parse_thread_id(id: &str) -> Option<(&str, usize)> {
    let (request_id, thread) = id.rsplit_once("-thread-")?;
    Some((request_id, thread.parse().ok()?))
}
