//! JSON control messages exchanged over the hub WebSocket.
//!
//! Every message is a union-tagged object with a mandatory `type` field;
//! payload fields are camelCase. SDP and ICE payloads are opaque to the hub
//! and relayed verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A friend entry as rendered to clients, presence overlaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendView {
    pub id: String,
    pub name: String,
    pub is_online: bool,
}

/// Optional file descriptor carried through a session request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    GetConnectCode,
    GetFriends,
    AddFriend {
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionRequest {
        peer_id: String,
        session_id: String,
        #[serde(flatten)]
        file: FileHint,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionAccept {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionReject {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcOffer {
        peer_id: String,
        offer: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcAnswer {
        peer_id: String,
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcIceCandidate {
        peer_id: String,
        candidate: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionReady {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionClose {
        session_id: String,
    },
}

impl ClientMessage {
    /// The complete set of recognized ingress `type` tags. Payloads of a
    /// recognized type that fail to decode are malformed, not unknown.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "ping",
        "get_connect_code",
        "get_friends",
        "add_friend",
        "rtc_session_request",
        "rtc_session_accept",
        "rtc_session_reject",
        "rtc_offer",
        "rtc_answer",
        "rtc_ice_candidate",
        "rtc_session_ready",
        "rtc_session_close",
    ];

    pub fn is_known_type(tag: &str) -> bool {
        Self::KNOWN_TYPES.contains(&tag)
    }
}

/// Messages emitted to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected {
        user_id: String,
        email: String,
    },
    Ping,
    Pong,
    ConnectCode {
        code: String,
    },
    FriendsList {
        friends: Vec<FriendView>,
    },
    FriendAdded {
        friend: FriendView,
    },
    #[serde(rename_all = "camelCase")]
    FriendOnline {
        friend_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FriendOffline {
        friend_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionRequest {
        sender_id: String,
        sender_name: String,
        session_id: String,
        #[serde(flatten)]
        file: FileHint,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionAccept {
        session_id: String,
        sender_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionReject {
        session_id: String,
        sender_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcOffer {
        sender_id: String,
        offer: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcAnswer {
        sender_id: String,
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcIceCandidate {
        sender_id: String,
        candidate: Value,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionReady {
        session_id: String,
        sender_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RtcSessionClose {
        session_id: String,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_samples() -> Vec<ClientMessage> {
        vec![
            ClientMessage::Ping,
            ClientMessage::GetConnectCode,
            ClientMessage::GetFriends,
            ClientMessage::AddFriend {
                code: "X8K9MP".to_string(),
            },
            ClientMessage::RtcSessionRequest {
                peer_id: "u-2".to_string(),
                session_id: "s-1".to_string(),
                file: FileHint {
                    file_name: Some("r.bin".to_string()),
                    file_size: Some(131_072),
                    file_type: Some("bin".to_string()),
                },
            },
            ClientMessage::RtcSessionAccept {
                session_id: "s-1".to_string(),
            },
            ClientMessage::RtcSessionReject {
                session_id: "s-1".to_string(),
            },
            ClientMessage::RtcOffer {
                peer_id: "u-2".to_string(),
                offer: json!({"sdp": "v=0", "type": "offer"}),
            },
            ClientMessage::RtcAnswer {
                peer_id: "u-1".to_string(),
                answer: json!({"sdp": "v=0", "type": "answer"}),
            },
            ClientMessage::RtcIceCandidate {
                peer_id: "u-2".to_string(),
                candidate: json!({"candidate": "candidate:0 1 UDP"}),
            },
            ClientMessage::RtcSessionReady {
                session_id: "s-1".to_string(),
            },
            ClientMessage::RtcSessionClose {
                session_id: "s-1".to_string(),
            },
        ]
    }

    #[test]
    fn client_messages_roundtrip() {
        for message in client_samples() {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn client_tags_are_all_known() {
        for message in client_samples() {
            let value = serde_json::to_value(&message).unwrap();
            let tag = value.get("type").and_then(Value::as_str).unwrap();
            assert!(
                ClientMessage::is_known_type(tag),
                "tag {tag} missing from KNOWN_TYPES"
            );
        }
    }

    #[test]
    fn server_messages_roundtrip() {
        let samples = vec![
            ServerMessage::Connected {
                user_id: "u-1".to_string(),
                email: "ada@example.com".to_string(),
            },
            ServerMessage::Pong,
            ServerMessage::ConnectCode {
                code: "X8K9MP".to_string(),
            },
            ServerMessage::FriendsList {
                friends: vec![FriendView {
                    id: "u-2".to_string(),
                    name: "grace".to_string(),
                    is_online: true,
                }],
            },
            ServerMessage::FriendOnline {
                friend_id: "u-2".to_string(),
            },
            ServerMessage::RtcSessionRequest {
                sender_id: "u-1".to_string(),
                sender_name: "ada".to_string(),
                session_id: "s-1".to_string(),
                file: FileHint::default(),
            },
            ServerMessage::RtcOffer {
                sender_id: "u-1".to_string(),
                offer: json!({"sdp": "v=0"}),
            },
            ServerMessage::Error {
                message: "Already friends".to_string(),
            },
        ];
        for message in samples {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn session_request_flattens_file_hint() {
        let message = ClientMessage::RtcSessionRequest {
            peer_id: "u-2".to_string(),
            session_id: "s-1".to_string(),
            file: FileHint {
                file_name: Some("r.bin".to_string()),
                file_size: Some(131_072),
                file_type: None,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "rtc_session_request");
        assert_eq!(value["peerId"], "u-2");
        assert_eq!(value["fileName"], "r.bin");
        assert_eq!(value["fileSize"], 131_072);
        assert!(value.get("fileType").is_none());
        assert!(value.get("file").is_none());
    }

    #[test]
    fn friend_view_uses_camel_case_presence() {
        let view = FriendView {
            id: "u-2".to_string(),
            name: "grace".to_string(),
            is_online: false,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["isOnline"], false);
        assert!(value.get("is_online").is_none());
    }

    #[test]
    fn unknown_type_fails_decode() {
        let raw = json!({"type": "rtc_media_mute", "peerId": "u-2"});
        assert!(serde_json::from_value::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn relay_payloads_survive_verbatim() {
        let offer = json!({"sdp": "v=0\r\no=- 46117 2", "type": "offer", "ext": {"k": [1, 2]}});
        let message = ClientMessage::RtcOffer {
            peer_id: "u-2".to_string(),
            offer: offer.clone(),
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ClientMessage::RtcOffer { offer: relayed, .. } => assert_eq!(relayed, offer),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
