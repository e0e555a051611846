//! Coordination relay protocol. JSON text frames discriminated by `type`

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error text sent back when a forwarding target has no live socket
pub const TARGET_UNAVAILABLE: &str = "target peer not available";

/// Presence status broadcast when a peer's socket closes
pub const STATUS_OFFLINE: &str = "offline";

/// Presence status broadcast when a peer registers
pub const STATUS_ONLINE: &str = "online";

/// Frames sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register { peer_id: String, display_name: String },
    Signal {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        signal: Value,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        offer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_type: Option<String>,
    },
    Answer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        answer: Value,
    },
    IceCandidate {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: Value,
    },
    StatusUpdate { status: String },
    Ping,
}

/// Frames sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered { peer_id: String },
    Signal { from: String, signal: Value },
    #[serde(rename_all = "camelCase")]
    Offer {
        from: String,
        offer: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_type: Option<String>,
    },
    Answer { from: String, answer: Value },
    IceCandidate { from: String, candidate: Value },
    #[serde(rename_all = "camelCase")]
    PeerStatus {
        peer_id: String,
        status: String,
        timestamp: u64,
    },
    Pong,
    Error {
        message: String,
        /// Peer a rejected forward was addressed to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Target peer for the four forwarding kinds
    pub fn target(&self) -> Option<&str> {
        match self {
            ClientMessage::Signal { to, .. }
            | ClientMessage::Offer { to, .. }
            | ClientMessage::Answer { to, .. }
            | ClientMessage::IceCandidate { to, .. } => Some(to.as_str()),
            _ => None,
        }
    }

    /// Turn a forwarding frame into what the target receives, stamped with
    /// `from`. Returns `None` for non-forwarding kinds.
    pub fn into_forwarded(self, from: String) -> Option<(String, ServerMessage)> {
        match self {
            ClientMessage::Signal { to, signal, .. } => {
                Some((to, ServerMessage::Signal { from, signal }))
            }
            ClientMessage::Offer {
                to,
                offer,
                call_type,
                ..
            } => Some((
                to,
                ServerMessage::Offer {
                    from,
                    offer,
                    call_type,
                },
            )),
            ClientMessage::Answer { to, answer, .. } => {
                Some((to, ServerMessage::Answer { from, answer }))
            }
            ClientMessage::IceCandidate { to, candidate, .. } => {
                Some((to, ServerMessage::IceCandidate { from, candidate }))
            }
            _ => None,
        }
    }

    /// Client-supplied `from`, if any
    pub fn claimed_from(&self) -> Option<&str> {
        match self {
            ClientMessage::Signal { from, .. }
            | ClientMessage::Offer { from, .. }
            | ClientMessage::Answer { from, .. }
            | ClientMessage::IceCandidate { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::StatusUpdate { .. } => "status-update",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            target: None,
        }
    }

    /// Reply to a forward whose target has no live socket
    pub fn target_unavailable(target: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: TARGET_UNAVAILABLE.to_string(),
            target: Some(target.into()),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::Signal { .. } => "signal",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::PeerStatus { .. } => "peer-status",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_shape() {
        let msg = ClientMessage::from_json(
            r#"{"type":"register","peerId":"a1","displayName":"Alice"}"#,
        )
        .expect("Failed to parse register");

        assert_eq!(
            msg,
            ClientMessage::Register {
                peer_id: "a1".to_string(),
                display_name: "Alice".to_string(),
            }
        );
    }

    #[test]
    fn test_ping_without_body() {
        let msg = ClientMessage::from_json(r#"{"type":"ping"}"#).expect("Failed to parse ping");
        assert_eq!(msg, ClientMessage::Ping);
        assert_eq!(ServerMessage::Pong.to_json().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_ice_candidate_tag_is_kebab_case() {
        let msg = ClientMessage::IceCandidate {
            to: "b1".to_string(),
            from: Some("a1".to_string()),
            candidate: json!({"candidate": "c"}),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(msg.target(), Some("b1"));
    }

    #[test]
    fn test_offer_forwarding_keeps_call_type() {
        let msg = ClientMessage::from_json(
            r#"{"type":"offer","to":"b1","from":"a1","offer":{"sdp":"x"},"callType":"video"}"#,
        )
        .unwrap();

        let (target, forwarded) = msg.into_forwarded("a1".to_string()).unwrap();
        assert_eq!(target, "b1");
        match forwarded {
            ServerMessage::Offer {
                from, call_type, ..
            } => {
                assert_eq!(from, "a1");
                assert_eq!(call_type.as_deref(), Some("video"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_status_update_is_not_forwarded() {
        let msg = ClientMessage::StatusUpdate {
            status: "away".to_string(),
        };
        assert!(msg.target().is_none());
        assert!(msg.into_forwarded("a1".to_string()).is_none());
    }

    #[test]
    fn test_peer_status_wire_shape() {
        let msg = ServerMessage::PeerStatus {
            peer_id: "a1".to_string(),
            status: STATUS_OFFLINE.to_string(),
            timestamp: 42,
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "peer-status");
        assert_eq!(value["peerId"], "a1");
        assert_eq!(value["timestamp"], 42);
    }

    #[test]
    fn test_error_target_is_optional_on_the_wire() {
        let plain: Value = serde_json::from_str(&ServerMessage::error("bad").to_json().unwrap()).unwrap();
        assert_eq!(plain, json!({"type": "error", "message": "bad"}));

        let msg = ServerMessage::target_unavailable("b1");
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["message"], TARGET_UNAVAILABLE);
        assert_eq!(value["target"], "b1");

        assert_eq!(
            ServerMessage::from_json(r#"{"type":"error","message":"bad"}"#).unwrap(),
            ServerMessage::error("bad")
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"signal","signal":{}}"#).is_err());
    }
}
