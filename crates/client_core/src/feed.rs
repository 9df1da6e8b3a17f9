use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    protocol::{ChangeEvent, ChangeKind, FeedServerMessage, FeedSubscribeRequest, MessageRow},
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Receiver of row-level change notifications. Implemented by the
/// synchronization engine; the subscriber holds no message state of its
/// own.
#[async_trait]
pub trait ChangeFeedSink: Send + Sync {
    async fn row_inserted(&self, row: MessageRow);
    async fn row_updated(&self, row: MessageRow);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Subscribed,
    /// Server closed the subscription; a reconnect is pending.
    Closed,
    /// Transport failure; a reconnect is pending.
    Errored,
    /// Retry budget exhausted. Terminal: live updates are gone for this
    /// room, request/response operations keep working.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Maximum consecutive failed connection cycles before the
    /// subscriber gives up and reports [`FeedStatus::Degraded`].
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeFeedOptions {
    /// Base URL of the change-feed service; `http(s)://` is rewritten to
    /// `ws(s)://`.
    pub feed_url: String,
    pub room_id: RoomId,
    pub policy: ReconnectPolicy,
}

/// Owned handle to one room-scoped feed subscription.
///
/// Exactly one underlying websocket is live at a time: each reconnect
/// cycle drops the previous stream before dialing again. `close`
/// cancels any pending reconnect timer and waits for the task to
/// finish; dropping the handle aborts the task outright.
pub struct ChangeFeedSubscriber {
    task: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<FeedStatus>,
}

impl ChangeFeedSubscriber {
    pub fn open(options: ChangeFeedOptions, sink: Arc<dyn ChangeFeedSink>) -> Self {
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_subscription(options, sink, status_tx, shutdown_rx));
        Self {
            task: Some(task),
            shutdown: shutdown_tx,
            status: status_rx,
        }
    }

    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> FeedStatus {
        *self.status.borrow()
    }

    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeFeedSubscriber {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum SessionOutcome {
    Shutdown,
    ServerClosed { was_subscribed: bool },
    TransportError {
        was_subscribed: bool,
        error: anyhow::Error,
    },
}

async fn run_subscription(
    options: ChangeFeedOptions,
    sink: Arc<dyn ChangeFeedSink>,
    status: watch::Sender<FeedStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    loop {
        let _ = status.send(FeedStatus::Connecting);
        let outcome = run_session(&options, &sink, &status, &mut shutdown).await;
        let was_subscribed = match outcome {
            SessionOutcome::Shutdown => {
                debug!(room_id = options.room_id.0, "change feed shut down");
                return;
            }
            SessionOutcome::ServerClosed { was_subscribed } => {
                warn!(room_id = options.room_id.0, "change feed closed by server");
                let _ = status.send(FeedStatus::Closed);
                was_subscribed
            }
            SessionOutcome::TransportError {
                was_subscribed,
                error,
            } => {
                warn!(
                    room_id = options.room_id.0,
                    "change feed session failed: {error:#}"
                );
                let _ = status.send(FeedStatus::Errored);
                was_subscribed
            }
        };

        // The budget bounds consecutive failures; a session that reached
        // the subscribed state starts a fresh budget.
        if was_subscribed {
            failures = 0;
        }
        failures += 1;
        if failures >= options.policy.max_attempts {
            warn!(
                room_id = options.room_id.0,
                attempts = failures,
                "change feed degraded: retry budget exhausted"
            );
            let _ = status.send(FeedStatus::Degraded);
            return;
        }

        let delay = options.policy.delay_for(failures);
        info!(
            room_id = options.room_id.0,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "change feed reconnecting"
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                debug!(room_id = options.room_id.0, "reconnect cancelled by shutdown");
                return;
            }
        }
    }
}

async fn run_session(
    options: &ChangeFeedOptions,
    sink: &Arc<dyn ChangeFeedSink>,
    status: &watch::Sender<FeedStatus>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    let url = match feed_ws_url(&options.feed_url, options.room_id) {
        Ok(url) => url,
        Err(error) => {
            return SessionOutcome::TransportError {
                was_subscribed: false,
                error,
            }
        }
    };

    let ws_stream = tokio::select! {
        result = connect_async(&url) => match result {
            Ok((stream, _)) => stream,
            Err(err) => {
                return SessionOutcome::TransportError {
                    was_subscribed: false,
                    error: anyhow!("failed to connect change feed {url}: {err}"),
                }
            }
        },
        _ = shutdown.changed() => return SessionOutcome::Shutdown,
    };
    let (mut writer, mut reader) = ws_stream.split();

    let subscribe = FeedSubscribeRequest::messages(options.room_id);
    let payload = match serde_json::to_string(&subscribe) {
        Ok(payload) => payload,
        Err(err) => {
            return SessionOutcome::TransportError {
                was_subscribed: false,
                error: anyhow!("failed to encode subscribe request: {err}"),
            }
        }
    };
    if let Err(err) = writer.send(Message::Text(payload)).await {
        return SessionOutcome::TransportError {
            was_subscribed: false,
            error: anyhow!("failed to send subscribe request: {err}"),
        };
    }

    let mut was_subscribed = false;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return SessionOutcome::Shutdown;
            }
            frame = reader.next() => match frame {
                None => return SessionOutcome::ServerClosed { was_subscribed },
                Some(Err(err)) => {
                    return SessionOutcome::TransportError {
                        was_subscribed,
                        error: anyhow!("change feed receive failed: {err}"),
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<FeedServerMessage>(&text) {
                    Ok(FeedServerMessage::Subscribed { room_id }) => {
                        if room_id != options.room_id {
                            warn!(
                                expected = options.room_id.0,
                                got = room_id.0,
                                "subscribe ack for unexpected room"
                            );
                            continue;
                        }
                        was_subscribed = true;
                        let _ = status.send(FeedStatus::Subscribed);
                        info!(room_id = options.room_id.0, "change feed subscribed");
                    }
                    Ok(FeedServerMessage::Closed) => {
                        return SessionOutcome::ServerClosed { was_subscribed }
                    }
                    Ok(FeedServerMessage::ChannelError { message }) => {
                        return SessionOutcome::TransportError {
                            was_subscribed,
                            error: anyhow!("channel error: {message}"),
                        }
                    }
                    Ok(FeedServerMessage::Change { event }) => {
                        dispatch_change(sink, options.room_id, event).await;
                    }
                    // One malformed event must not take down the
                    // subscription.
                    Err(err) => {
                        warn!(
                            room_id = options.room_id.0,
                            "dropping malformed feed frame: {err}"
                        );
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    return SessionOutcome::ServerClosed { was_subscribed }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn dispatch_change(sink: &Arc<dyn ChangeFeedSink>, room_id: RoomId, event: ChangeEvent) {
    match event.kind {
        ChangeKind::Insert => sink.row_inserted(event.new).await,
        ChangeKind::Update => sink.row_updated(event.new).await,
        // Deletion is out of scope for the engine.
        ChangeKind::Delete => debug!(
            room_id = room_id.0,
            message_id = event.new.id.0,
            "ignoring delete event"
        ),
    }
}

fn feed_ws_url(feed_url: &str, room_id: RoomId) -> Result<String> {
    let base = if let Some(rest) = feed_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = feed_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if feed_url.starts_with("ws://") || feed_url.starts_with("wss://") {
        feed_url.to_string()
    } else {
        return Err(anyhow!(
            "feed_url must start with http://, https://, ws:// or wss://"
        ));
    };
    Ok(format!(
        "{}/feed?room_id={}",
        base.trim_end_matches('/'),
        room_id.0
    ))
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
