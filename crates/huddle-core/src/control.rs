//! Control channel messages.
//!
//! The control channel is ordered and reliable and carries small JSON
//! messages tagged by `type`, e.g.
//! `{"type":"cancel-transfer","requestId":"transfer-42-thread-3"}`.

use huddle_files::ByteRange;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Request for one file (or one thread's byte range of it)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Thread request id (`<transfer>-thread-<n>`) or whole-transfer id
    pub request_id: String,
    /// Share the file belongs to
    pub share_id: String,
    /// Peer serving the file
    pub owner_id: String,
    /// Peer downloading the file
    pub requester_id: String,
    /// Path of the file relative to the share root
    pub file_path: String,
    /// File name for display
    pub file_name: String,
    /// Declared file size
    pub file_size: u64,
    /// First byte of the requested range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u64>,
    /// One past the last byte of the requested range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u64>,
    /// Index of the parallel thread this request serves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_index: Option<u32>,
    /// Password of a protected share
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl TransferRequest {
    /// Requested byte range, defaulting to the whole file
    pub fn range(&self) -> ByteRange {
        ByteRange::new(
            self.range_start.unwrap_or(0),
            self.range_end.unwrap_or(self.file_size),
        )
    }
}

/// Messages exchanged on the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Ask the owner to stream a file range
    TransferRequest(TransferRequest),
    /// Stop streaming a request
    CancelTransfer {
        /// Thread or whole-transfer request id
        request_id: String,
    },
    /// Liveness ping
    Heartbeat {
        /// Sender clock, unix milliseconds
        timestamp: i64,
    },
    /// Microphone state of the sender
    StatusUpdate {
        /// Whether the sender's microphone is live
        mic_enabled: bool,
    },
}

impl ControlMessage {
    /// Heartbeat stamped with the current time
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: now_millis(),
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whether the message belongs to the transfer engine
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::TransferRequest(_) | Self::CancelTransfer { .. })
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
