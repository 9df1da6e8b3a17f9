use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, MessageId, MessageKind, RoomId, UserId};

/// Durable message as returned by the message-store API, including the
/// joined sender metadata the change feed does not carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub attachment_id: AttachmentId,
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
}

/// Bare persisted columns emitted by the change feed for one message
/// row. No joined sender metadata; hydrate through the store when a
/// full [`MessagePayload`] is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level notification from the change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub new: MessageRow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<MessageRow>,
}

/// Subscription request for a room-scoped message feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSubscribeRequest {
    pub table: String,
    pub room_id: RoomId,
}

impl FeedSubscribeRequest {
    pub fn messages(room_id: RoomId) -> Self {
        Self {
            table: "chat_messages".to_string(),
            room_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FeedServerMessage {
    Subscribed { room_id: RoomId },
    Closed,
    ChannelError { message: String },
    Change { event: ChangeEvent },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_event_decodes_without_old_row() {
        let raw = r#"{
            "type": "change",
            "payload": {
                "event": {
                    "kind": "insert",
                    "new": {
                        "id": 42,
                        "room_id": 7,
                        "sender_id": 3,
                        "content": "hello",
                        "kind": "text",
                        "created_at": "2024-05-01T10:00:00Z",
                        "updated_at": "2024-05-01T10:00:00Z"
                    }
                }
            }
        }"#;

        let decoded: FeedServerMessage = serde_json::from_str(raw).expect("decode");
        match decoded {
            FeedServerMessage::Change { event } => {
                assert_eq!(event.kind, ChangeKind::Insert);
                assert_eq!(event.new.id, MessageId(42));
                assert!(event.old.is_none());
                assert!(!event.new.is_edited);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn subscribe_request_targets_message_table() {
        let request = FeedSubscribeRequest::messages(RoomId(9));
        let encoded = serde_json::to_string(&request).expect("encode");
        assert!(encoded.contains("\"chat_messages\""));
        assert!(encoded.contains("\"room_id\":9"));
    }
}
