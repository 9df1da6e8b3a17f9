use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::{MessageId, RoomId},
    error::ApiError,
    protocol::{CreateMessageRequest, MessagePayload},
};

/// Request/response surface of the message store. All durable
/// operations go through here; the change feed never writes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Full ordered history for a room.
    async fn list_messages(&self, room_id: RoomId) -> Result<Vec<MessagePayload>>;
    /// Persists a draft and returns the durable message.
    async fn create_message(
        &self,
        room_id: RoomId,
        draft: CreateMessageRequest,
    ) -> Result<MessagePayload>;
    /// Single-message fetch, used to hydrate a bare change-feed row with
    /// joined sender metadata.
    async fn fetch_message(&self, room_id: RoomId, message_id: MessageId)
        -> Result<MessagePayload>;
    /// Marks the room's unread messages (not sent by the local user) read.
    async fn mark_read(&self, room_id: RoomId) -> Result<()>;
}

pub struct HttpMessageStore {
    http: Client,
    base_url: String,
}

impl HttpMessageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Maps a non-2xx response to the store's error body when one is
/// present, falling back to the bare status code.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(body) => Err(anyhow::Error::new(body)),
        Err(_) => Err(anyhow!("message store returned {status}")),
    }
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn list_messages(&self, room_id: RoomId) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(format!("{}/rooms/{}/messages", self.base_url, room_id.0))
            .send()
            .await
            .with_context(|| format!("failed to list messages for room {}", room_id.0))?;
        let messages = check_status(response).await?.json().await?;
        Ok(messages)
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        draft: CreateMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!("{}/rooms/{}/messages", self.base_url, room_id.0))
            .json(&draft)
            .send()
            .await
            .with_context(|| format!("failed to send message to room {}", room_id.0))?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }

    async fn fetch_message(
        &self,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .get(format!(
                "{}/rooms/{}/messages/{}",
                self.base_url, room_id.0, message_id.0
            ))
            .send()
            .await
            .with_context(|| format!("failed to fetch message {}", message_id.0))?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }

    async fn mark_read(&self, room_id: RoomId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/rooms/{}/read", self.base_url, room_id.0))
            .send()
            .await
            .with_context(|| format!("failed to mark room {} as read", room_id.0))?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/store_client_tests.rs"]
mod tests;
