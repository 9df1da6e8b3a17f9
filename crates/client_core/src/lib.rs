//! Client-side chat synchronization.
//!
//! One [`ChatSyncEngine`] per open room owns the ordered message list
//! the UI renders and keeps it convergent across the two delivery
//! paths of a send: the HTTP confirmation and the change-feed echo of
//! the same row. The change-feed subscriber only calls into the
//! engine; it holds no message state itself.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{DeliveryState, MessageKind, RoomId, UserId},
    protocol::{AttachmentPayload, CreateMessageRequest, MessageRow},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod correlation;
pub mod error;
pub mod feed;
pub mod notify;
pub mod store_client;
pub mod types;

pub use error::SendError;
pub use feed::{
    ChangeFeedOptions, ChangeFeedSink, ChangeFeedSubscriber, FeedStatus, ReconnectPolicy,
};
pub use notify::{InboundNotifier, SilentNotifier};
pub use store_client::{HttpMessageStore, MessageStore};
pub use types::{ChatEvent, ChatMessage, MessageRef};

use correlation::CorrelationTracker;

/// How long a correlation entry stays live after a send is confirmed:
/// long enough to absorb the change-feed echo of that write, short
/// enough not to accumulate over a session.
const CORRELATION_GRACE: Duration = Duration::from_secs(3);

pub struct ChatSyncEngine {
    room_id: RoomId,
    user_id: UserId,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn InboundNotifier>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<ChatEvent>,
}

struct EngineState {
    messages: Vec<ChatMessage>,
    correlation: CorrelationTracker,
    loading: bool,
    in_flight_sends: usize,
    last_error: Option<String>,
}

impl ChatSyncEngine {
    pub fn new(room_id: RoomId, user_id: UserId, store: Arc<dyn MessageStore>) -> Arc<Self> {
        Self::new_with_notifier(room_id, user_id, store, Arc::new(SilentNotifier))
    }

    pub fn new_with_notifier(
        room_id: RoomId,
        user_id: UserId,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn InboundNotifier>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            room_id,
            user_id,
            store,
            notifier,
            inner: Mutex::new(EngineState {
                messages: Vec::new(),
                correlation: CorrelationTracker::new(CORRELATION_GRACE),
                loading: false,
                in_flight_sends: 0,
                last_error: None,
            }),
            events,
        })
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the visible message list, in display order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.lock().await.loading
    }

    pub async fn in_flight_sends(&self) -> usize {
        self.inner.lock().await.in_flight_sends
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }

    /// Fetches the full history for the room and replaces local state.
    ///
    /// Call at mount, before any sends are in flight: in-flight
    /// optimistic entries are not merged. On failure the existing list
    /// is left untouched.
    pub async fn load(&self) -> Result<usize> {
        {
            let mut guard = self.inner.lock().await;
            guard.loading = true;
            guard.last_error = None;
        }

        let result = self.store.list_messages(self.room_id).await;

        let mut guard = self.inner.lock().await;
        guard.loading = false;
        match result {
            Ok(payloads) => {
                let mut messages: Vec<ChatMessage> = payloads
                    .iter()
                    .map(|payload| ChatMessage::from_payload(payload, DeliveryState::Confirmed))
                    .collect();
                messages.sort_by_key(|message| message.created_at);
                let count = messages.len();
                guard.messages = messages;
                drop(guard);
                info!(room_id = self.room_id.0, count, "room history loaded");
                let _ = self.events.send(ChatEvent::MessagesLoaded { count });
                Ok(count)
            }
            Err(err) => {
                guard.last_error = Some(err.to_string());
                drop(guard);
                Err(err)
                    .with_context(|| format!("failed to load history for room {}", self.room_id.0))
            }
        }
    }

    pub async fn refresh(&self) -> Result<usize> {
        self.load().await
    }

    /// Optimistic send: the draft appears in the list immediately as
    /// `Pending`, then settles in place as `Confirmed` or `Failed` when
    /// the store call resolves. Returns the confirmed message.
    pub async fn send(
        &self,
        content: &str,
        kind: MessageKind,
        attachments: Vec<AttachmentPayload>,
    ) -> Result<ChatMessage> {
        let content = content.trim();
        if content.is_empty() && attachments.is_empty() {
            return Err(SendError::EmptyDraft.into());
        }

        let provisional_id = Uuid::new_v4();
        let issued_at = Utc::now();
        let draft = CreateMessageRequest {
            content: content.to_string(),
            kind,
            attachments: attachments.clone(),
        };
        let optimistic = ChatMessage {
            id: MessageRef::Provisional(provisional_id),
            room_id: self.room_id,
            sender_id: self.user_id,
            sender_name: None,
            content: content.to_string(),
            kind,
            attachments,
            created_at: issued_at,
            updated_at: issued_at,
            is_edited: false,
            delivery: DeliveryState::Pending,
        };

        {
            let mut guard = self.inner.lock().await;
            guard.messages.push(optimistic);
            guard.in_flight_sends += 1;
            guard.last_error = None;
        }

        let result = self.store.create_message(self.room_id, draft).await;

        let mut guard = self.inner.lock().await;
        guard.in_flight_sends -= 1;
        match result {
            Ok(payload) => {
                guard
                    .correlation
                    .record(provisional_id, payload.message_id, Instant::now());
                // Inverse race: the change-feed echo may already have
                // appended the durable row. The pending entry keeps its
                // issue-time position, so drop the appended copy.
                guard
                    .messages
                    .retain(|message| message.id != MessageRef::Durable(payload.message_id));
                let confirmed = ChatMessage::from_payload(&payload, DeliveryState::Confirmed);
                match guard
                    .messages
                    .iter()
                    .position(|message| message.id == MessageRef::Provisional(provisional_id))
                {
                    Some(index) => guard.messages[index] = confirmed.clone(),
                    // List was replaced while the send was in flight.
                    None => guard.messages.push(confirmed.clone()),
                }
                drop(guard);
                debug!(
                    room_id = self.room_id.0,
                    message_id = payload.message_id.0,
                    "send confirmed"
                );
                let _ = self.events.send(ChatEvent::MessageConfirmed {
                    provisional_id,
                    message: confirmed.clone(),
                });
                Ok(confirmed)
            }
            Err(err) => {
                if let Some(entry) = guard
                    .messages
                    .iter_mut()
                    .find(|message| message.id == MessageRef::Provisional(provisional_id))
                {
                    entry.delivery = DeliveryState::Failed;
                }
                guard.last_error = Some(err.to_string());
                drop(guard);
                warn!(room_id = self.room_id.0, "send failed: {err:#}");
                let _ = self.events.send(ChatEvent::MessageFailed {
                    provisional_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Re-sends a failed entry: removes it and pushes the original
    /// draft through [`send`](Self::send) again.
    pub async fn retry(&self, provisional_id: Uuid) -> Result<ChatMessage> {
        let failed = {
            let mut guard = self.inner.lock().await;
            let index = guard
                .messages
                .iter()
                .position(|message| {
                    message.id == MessageRef::Provisional(provisional_id)
                        && message.delivery == DeliveryState::Failed
                })
                .ok_or(SendError::NotRetryable)?;
            guard.messages.remove(index)
        };
        self.send(&failed.content, failed.kind, failed.attachments)
            .await
    }

    /// Best-effort read acknowledgement for the room.
    pub async fn mark_as_read(&self) -> Result<()> {
        self.store
            .mark_read(self.room_id)
            .await
            .with_context(|| format!("failed to mark room {} as read", self.room_id.0))
    }

    /// Handles a row-inserted change-feed event.
    ///
    /// Dedup order: visible list first, then live correlation entries,
    /// then the failed-send echo check, and only then a hydrating
    /// fetch for a genuinely new message.
    pub async fn on_inbound_insert(&self, row: MessageRow) {
        if row.room_id != self.room_id {
            return;
        }

        {
            let mut guard = self.inner.lock().await;
            if guard
                .messages
                .iter()
                .any(|message| message.id == MessageRef::Durable(row.id))
            {
                debug!(
                    message_id = row.id.0,
                    "inbound insert ignored: already visible"
                );
                return;
            }
            if guard.correlation.contains_durable(row.id, Instant::now()) {
                debug!(
                    message_id = row.id.0,
                    "inbound insert ignored: echo of own recent send"
                );
                return;
            }
            if row.sender_id == self.user_id {
                // Ambiguous-outcome send: the transport reported failure
                // but the write landed. Treat the echo as the missing
                // confirmation of the matching failed entry.
                if let Some(index) = guard.messages.iter().position(|message| {
                    message.delivery == DeliveryState::Failed
                        && message.kind == row.kind
                        && message.content == row.content
                }) {
                    let previous = guard.messages[index].id;
                    let entry = &mut guard.messages[index];
                    entry.id = MessageRef::Durable(row.id);
                    entry.delivery = DeliveryState::Confirmed;
                    entry.created_at = row.created_at;
                    entry.updated_at = row.updated_at;
                    entry.is_edited = row.is_edited;
                    let message = entry.clone();
                    drop(guard);
                    info!(
                        message_id = row.id.0,
                        "change-feed echo confirmed a previously failed send"
                    );
                    if let MessageRef::Provisional(provisional_id) = previous {
                        let _ = self.events.send(ChatEvent::MessageConfirmed {
                            provisional_id,
                            message,
                        });
                    }
                    return;
                }
            }
        }

        // Genuinely new row. Change-feed rows carry only the persisted
        // columns, so hydrate through the store before display.
        let payload = match self.store.fetch_message(self.room_id, row.id).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    message_id = row.id.0,
                    "dropping inbound insert: hydration failed: {err:#}"
                );
                return;
            }
        };
        let message = ChatMessage::from_payload(&payload, DeliveryState::Confirmed);
        let from_remote = !message.is_own(self.user_id);

        {
            let mut guard = self.inner.lock().await;
            // Re-check both dedup conditions: the HTTP confirmation may
            // have resolved while the fetch was in flight.
            if guard
                .messages
                .iter()
                .any(|entry| entry.id == MessageRef::Durable(row.id))
            {
                return;
            }
            if guard.correlation.contains_durable(row.id, Instant::now()) {
                return;
            }
            guard.messages.push(message.clone());
        }

        if from_remote {
            self.spawn_read_mark();
            self.notifier.message_received();
        }
        let _ = self.events.send(ChatEvent::MessageReceived { message });
    }

    /// Handles a row-updated change-feed event. Unknown rows are
    /// dropped without fetching: an edit arriving before its base
    /// insert is an accepted rare race.
    pub async fn on_inbound_update(&self, row: MessageRow) {
        if row.room_id != self.room_id {
            return;
        }

        let mut guard = self.inner.lock().await;
        let Some(entry) = guard
            .messages
            .iter_mut()
            .find(|message| message.id == MessageRef::Durable(row.id))
        else {
            debug!(
                message_id = row.id.0,
                "inbound update ignored: row not visible"
            );
            return;
        };
        entry.content = row.content;
        entry.is_edited = row.is_edited;
        entry.updated_at = row.updated_at;
        drop(guard);
        let _ = self
            .events
            .send(ChatEvent::MessageEdited { message_id: row.id });
    }

    /// Opens the change feed for this room with the engine as sink and
    /// mirrors status transitions into [`ChatEvent::FeedStatusChanged`].
    pub fn attach_feed(self: Arc<Self>, options: ChangeFeedOptions) -> ChangeFeedSubscriber {
        let subscriber =
            ChangeFeedSubscriber::open(options, Arc::clone(&self) as Arc<dyn ChangeFeedSink>);
        let mut status = subscriber.status();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let current = *status.borrow_and_update();
                let _ = events.send(ChatEvent::FeedStatusChanged(current));
                if status.changed().await.is_err() {
                    break;
                }
            }
        });
        subscriber
    }

    fn spawn_read_mark(&self) {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let room_id = self.room_id;
        tokio::spawn(async move {
            if let Err(err) = store.mark_read(room_id).await {
                warn!(
                    room_id = room_id.0,
                    "read-mark after inbound message failed: {err:#}"
                );
                let _ = events.send(ChatEvent::Error(format!(
                    "failed to mark room {} as read: {err}",
                    room_id.0
                )));
            }
        });
    }
}

#[async_trait]
impl ChangeFeedSink for ChatSyncEngine {
    async fn row_inserted(&self, row: MessageRow) {
        self.on_inbound_insert(row).await;
    }

    async fn row_updated(&self, row: MessageRow) {
        self.on_inbound_update(row).await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
