//! Signaling wire protocol.
//!
//! Every message is a JSON text frame with a `type` tag in kebab-case and
//! camelCase fields, e.g. `{"type":"player-left","id":"player-100"}`.
//! Inbound frames are validated here; anything that does not parse into a
//! [`SignalMessage`] is rejected at this boundary.

use crate::error::{Result, SignalingError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Local identity presented at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Unique peer id within the lobby
    pub id: String,
    /// Display name
    pub name: String,
}

impl Identity {
    /// Create a new identity
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Joining metadata sent with `register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMetadata {
    /// Lobby the client wants to join
    pub lobby_name: String,
    /// Lobby password, if the lobby is protected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_password: Option<String>,
    /// Client build version, checked against the server minimum
    pub client_version: String,
    /// Address of the client on the virtual network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,
}

/// Roster entry for a lobby member
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer id
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether the member's microphone is live
    #[serde(default)]
    pub mic_enabled: bool,
    /// Address on the virtual network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ip: Option<String>,
    /// Client build version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// ICE candidate as exchanged between browsers/agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// Candidate line
    pub candidate: String,
    /// Media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
}

/// Shared-folder catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    /// Share id
    pub id: String,
    /// Peer that owns the files
    pub owner_id: String,
    /// Display name
    pub name: String,
    /// Number of files currently listed
    #[serde(default)]
    pub file_count: u32,
    /// Whether access requires a password
    #[serde(default)]
    pub protected: bool,
}

/// Lobby chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Author id
    pub player_id: String,
    /// Author display name
    pub player_name: String,
    /// Message body
    pub content: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Signaling protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Server acknowledgement sent as soon as a socket is accepted
    Hello {
        /// Server build version
        server_version: String,
    },

    /// Client joins the lobby
    Register {
        /// Client peer id
        id: String,
        /// Client display name
        name: String,
        /// Lobby credentials and client version
        metadata: RegisterMetadata,
    },

    /// Registration accepted
    RegisterSuccess,

    /// Registration rejected (recoverable, the socket stays open)
    RegisterError {
        /// Human-readable reason
        message: String,
    },

    /// Client is too old to join (fatal)
    VersionTooOld {
        /// Version the client reported
        current_version: String,
        /// Minimum version the server accepts
        minimum_version: String,
        /// Where to fetch a newer build
        #[serde(default, skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
    },

    /// Snapshot of current lobby members (excluding the recipient)
    PlayersList {
        /// Members
        players: Vec<PeerInfo>,
    },

    /// A member joined
    PlayerJoined {
        /// The new member
        #[serde(flatten)]
        player: PeerInfo,
    },

    /// A member left
    PlayerLeft {
        /// Id of the member that left
        id: String,
    },

    /// Session description offer
    Offer {
        /// Sender id
        from: String,
        /// Recipient id
        to: String,
        /// SDP body
        sdp: String,
    },

    /// Session description answer
    Answer {
        /// Sender id
        from: String,
        /// Recipient id
        to: String,
        /// SDP body
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Sender id
        from: String,
        /// Recipient id
        to: String,
        /// Candidate payload
        #[serde(flatten)]
        candidate: IceCandidateInit,
    },

    /// Microphone state change
    StatusUpdate {
        /// Member id
        client_id: String,
        /// Whether the microphone is live
        mic_enabled: bool,
    },

    /// Chat message
    ChatMessage(ChatMessage),

    /// Share published
    ShareAdded {
        /// Catalog entry
        share: ShareInfo,
    },

    /// Share withdrawn
    ShareRemoved {
        /// Catalog entry
        share: ShareInfo,
    },

    /// Share metadata changed
    ShareUpdated {
        /// Catalog entry
        share: ShareInfo,
    },
}

impl SignalMessage {
    /// Serialize message to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    /// Get the wire name of the message kind
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalMessage::Hello { .. } => "hello",
            SignalMessage::Register { .. } => "register",
            SignalMessage::RegisterSuccess => "register-success",
            SignalMessage::RegisterError { .. } => "register-error",
            SignalMessage::VersionTooOld { .. } => "version-too-old",
            SignalMessage::PlayersList { .. } => "players-list",
            SignalMessage::PlayerJoined { .. } => "player-joined",
            SignalMessage::PlayerLeft { .. } => "player-left",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::StatusUpdate { .. } => "status-update",
            SignalMessage::ChatMessage(_) => "chat-message",
            SignalMessage::ShareAdded { .. } => "share-added",
            SignalMessage::ShareRemoved { .. } => "share-removed",
            SignalMessage::ShareUpdated { .. } => "share-updated",
        }
    }

    /// Recipient of a peer-addressed message, if any
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Rewrite the sender of a peer-addressed message
    ///
    /// The relay stamps the registered id so members cannot spoof each other.
    pub fn set_sender(&mut self, sender: &str) {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::IceCandidate { from, .. } => *from = sender.to_string(),
            SignalMessage::StatusUpdate { client_id, .. } => *client_id = sender.to_string(),
            SignalMessage::ChatMessage(chat) => chat.player_id = sender.to_string(),
            _ => {}
        }
    }
}

/// Compare dotted numeric versions (`"1.10.0" > "1.9.3"`)
///
/// Missing components count as zero; non-numeric components are ignored
/// after their leading digits.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| {
                let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }

    let (pa, pb) = (parts(a), parts(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_shape() {
        let msg = SignalMessage::Register {
            id: "player-100".to_string(),
            name: "Alice".to_string(),
            metadata: RegisterMetadata {
                lobby_name: "friday".to_string(),
                lobby_password: None,
                client_version: "0.4.0".to_string(),
                virtual_ip: Some("10.26.0.2".to_string()),
            },
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["id"], "player-100");
        assert_eq!(value["metadata"]["lobbyName"], "friday");
        assert_eq!(value["metadata"]["clientVersion"], "0.4.0");
        assert!(value["metadata"].get("lobbyPassword").is_none());
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let text = r#"{"type":"ice-candidate","from":"a","to":"b",
            "candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
            "sdpMLineIndex":0,"sdpMid":"0"}"#;
        let msg = SignalMessage::from_json(text).unwrap();

        match msg {
            SignalMessage::IceCandidate { from, to, candidate } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(candidate.sdp_m_line_index, Some(0));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_version_too_old_fields() {
        let text = r#"{"type":"version-too-old","currentVersion":"0.1.0",
            "minimumVersion":"0.3.0","downloadUrl":"https://example.invalid/dl"}"#;
        let msg = SignalMessage::from_json(text).unwrap();
        assert_eq!(msg.message_type(), "version-too-old");
        assert!(matches!(
            msg,
            SignalMessage::VersionTooOld { ref minimum_version, .. } if minimum_version == "0.3.0"
        ));
    }

    #[test]
    fn test_player_joined_is_flat() {
        let msg = SignalMessage::PlayerJoined {
            player: PeerInfo {
                id: "player-200".to_string(),
                name: "Bob".to_string(),
                mic_enabled: true,
                virtual_ip: None,
                client_version: None,
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["id"], "player-200");
        assert_eq!(value["micEnabled"], true);
    }

    #[test]
    fn test_unit_and_newtype_variants() {
        let ok = SignalMessage::from_json(r#"{"type":"register-success"}"#).unwrap();
        assert_eq!(ok, SignalMessage::RegisterSuccess);

        let chat = SignalMessage::from_json(
            r#"{"type":"chat-message","playerId":"p1","playerName":"P","content":"hi","timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(chat.message_type(), "chat-message");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalMessage::from_json(r#"{"type":"teleport","to":"x"}"#).unwrap_err();
        assert!(matches!(err, SignalingError::Serialization(_)));
    }

    #[test]
    fn test_set_sender_and_recipient() {
        let mut msg = SignalMessage::Answer {
            from: "spoofed".to_string(),
            to: "player-1".to_string(),
            sdp: "v=0".to_string(),
        };
        msg.set_sender("player-2");
        assert_eq!(msg.recipient(), Some("player-1"));
        assert!(matches!(msg, SignalMessage::Answer { ref from, .. } if from == "player-2"));
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("0.4", "0.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("v0.3.1", "0.4.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0.0-beta", "2.0.0"), Ordering::Equal);
    }
}
