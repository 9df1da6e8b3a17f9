use chrono::{DateTime, Utc};
use shared::{
    domain::{DeliveryState, MessageId, MessageKind, RoomId, UserId},
    protocol::{AttachmentPayload, MessagePayload},
};
use uuid::Uuid;

use crate::feed::FeedStatus;

/// Identifier of an entry in the visible message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRef {
    /// Client-minted id for a not-yet-persisted message. Locally unique,
    /// never sent to or recognized by the message store.
    Provisional(Uuid),
    /// Id assigned by the message store upon successful persistence.
    Durable(MessageId),
}

/// One entry of the visible message list.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: MessageRef,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<AttachmentPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_edited: bool,
    pub delivery: DeliveryState,
}

impl ChatMessage {
    pub fn is_own(&self, user_id: UserId) -> bool {
        self.sender_id == user_id
    }

    pub(crate) fn from_payload(payload: &MessagePayload, delivery: DeliveryState) -> Self {
        Self {
            id: MessageRef::Durable(payload.message_id),
            room_id: payload.room_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name.clone(),
            content: payload.content.clone(),
            kind: payload.kind,
            attachments: payload.attachments.clone(),
            created_at: payload.created_at,
            updated_at: payload.updated_at,
            is_edited: payload.is_edited,
            delivery,
        }
    }
}

/// Engine-to-UI notifications, delivered over a broadcast channel.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    MessagesLoaded {
        count: usize,
    },
    /// A pending entry was replaced in place by its durable version.
    MessageConfirmed {
        provisional_id: Uuid,
        message: ChatMessage,
    },
    /// A send settled as failed; the entry stays visible for retry.
    MessageFailed {
        provisional_id: Uuid,
        reason: String,
    },
    /// A new message arrived over the change feed.
    MessageReceived {
        message: ChatMessage,
    },
    MessageEdited {
        message_id: MessageId,
    },
    FeedStatusChanged(FeedStatus),
    Error(String),
}
