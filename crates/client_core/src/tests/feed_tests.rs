use super::*;
use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::{MessageId, MessageKind, UserId};
use tokio::{net::TcpListener, sync::Mutex};

const ROOM: RoomId = RoomId(3);

#[derive(Default)]
struct RecordingSink {
    inserts: Mutex<Vec<MessageRow>>,
    updates: Mutex<Vec<MessageRow>>,
}

#[async_trait]
impl ChangeFeedSink for RecordingSink {
    async fn row_inserted(&self, row: MessageRow) {
        self.inserts.lock().await.push(row);
    }

    async fn row_updated(&self, row: MessageRow) {
        self.updates.lock().await.push(row);
    }
}

#[derive(Clone)]
struct FeedServerState {
    /// Raw frames sent after the subscribe ack, in order.
    frames: Arc<Vec<String>>,
    subscriptions: Arc<AtomicUsize>,
    /// When false the server drops the socket once the frames are sent.
    hold_open: bool,
}

async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<FeedServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| feed_session(state, socket))
}

async fn feed_session(state: FeedServerState, mut socket: WebSocket) {
    let Some(Ok(WsMessage::Text(text))) = socket.recv().await else {
        return;
    };
    let Ok(request) = serde_json::from_str::<FeedSubscribeRequest>(&text) else {
        return;
    };
    state.subscriptions.fetch_add(1, Ordering::SeqCst);
    let ack = encode(&FeedServerMessage::Subscribed {
        room_id: request.room_id,
    });
    if socket.send(WsMessage::Text(ack)).await.is_err() {
        return;
    }
    for frame in state.frames.iter() {
        if socket.send(WsMessage::Text(frame.clone())).await.is_err() {
            return;
        }
    }
    if state.hold_open {
        while socket.recv().await.is_some() {}
    }
}

async fn spawn_feed_server(state: FeedServerState) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/feed", get(feed_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

/// Accepts connections and immediately drops them, so every websocket
/// handshake fails.
async fn spawn_refusing_server() -> Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    Ok((format!("ws://{addr}"), accepts))
}

fn encode(message: &FeedServerMessage) -> String {
    serde_json::to_string(message).expect("encode frame")
}

fn change_frame(kind: ChangeKind, row: MessageRow) -> String {
    encode(&FeedServerMessage::Change {
        event: ChangeEvent {
            kind,
            new: row,
            old: None,
        },
    })
}

fn row(id: i64, content: &str) -> MessageRow {
    MessageRow {
        id: MessageId(id),
        room_id: ROOM,
        sender_id: UserId(99),
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: "2024-05-01T10:00:00Z".parse().expect("timestamp"),
        updated_at: "2024-05-01T10:00:00Z".parse().expect("timestamp"),
        is_edited: false,
        is_read: false,
    }
}

fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn delivers_inserts_and_updates_to_the_sink() {
    let mut edited = row(5, "hi there (edited)");
    edited.is_edited = true;
    let state = FeedServerState {
        frames: Arc::new(vec![
            change_frame(ChangeKind::Insert, row(5, "hi there")),
            change_frame(ChangeKind::Update, edited),
        ]),
        subscriptions: Arc::new(AtomicUsize::new(0)),
        hold_open: true,
    };
    let url = spawn_feed_server(state.clone()).await.expect("spawn server");

    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: url,
            room_id: ROOM,
            policy: quick_policy(5),
        },
        sink.clone(),
    );

    let mut status = subscriber.status();
    while *status.borrow_and_update() != FeedStatus::Subscribed {
        status.changed().await.expect("status channel");
    }
    let watched = Arc::clone(&sink);
    eventually("both changes to arrive", || {
        let sink = Arc::clone(&watched);
        async move { !sink.updates.lock().await.is_empty() }
    })
    .await;

    let inserts = sink.inserts.lock().await;
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].id, MessageId(5));
    drop(inserts);
    let updates = sink.updates.lock().await;
    assert_eq!(updates.len(), 1);
    assert!(updates[0].is_edited);
    drop(updates);

    assert_eq!(state.subscriptions.load(Ordering::SeqCst), 1);
    subscriber.close().await;
}

#[tokio::test]
async fn malformed_frame_does_not_end_the_session() {
    let state = FeedServerState {
        frames: Arc::new(vec![
            "{not json".to_string(),
            change_frame(ChangeKind::Insert, row(5, "hi there")),
        ]),
        subscriptions: Arc::new(AtomicUsize::new(0)),
        hold_open: true,
    };
    let url = spawn_feed_server(state.clone()).await.expect("spawn server");

    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: url,
            room_id: ROOM,
            policy: quick_policy(5),
        },
        sink.clone(),
    );

    let watched = Arc::clone(&sink);
    eventually("the valid insert to arrive", || {
        let sink = Arc::clone(&watched);
        async move { !sink.inserts.lock().await.is_empty() }
    })
    .await;
    // The bad frame was skipped on the same connection.
    assert_eq!(state.subscriptions.load(Ordering::SeqCst), 1);
    subscriber.close().await;
}

#[tokio::test]
async fn reconnects_after_server_close_with_fresh_subscription() {
    let state = FeedServerState {
        frames: Arc::new(vec![change_frame(ChangeKind::Insert, row(5, "hi there"))]),
        subscriptions: Arc::new(AtomicUsize::new(0)),
        hold_open: false,
    };
    let url = spawn_feed_server(state.clone()).await.expect("spawn server");

    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: url,
            room_id: ROOM,
            policy: quick_policy(5),
        },
        sink.clone(),
    );

    let subscriptions = Arc::clone(&state.subscriptions);
    eventually("a second subscription after the server close", || {
        let subscriptions = Arc::clone(&subscriptions);
        async move { subscriptions.load(Ordering::SeqCst) >= 2 }
    })
    .await;
    subscriber.close().await;
}

#[tokio::test]
async fn degrades_after_retry_budget_is_exhausted() {
    let (url, accepts) = spawn_refusing_server().await.expect("spawn server");

    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: url,
            room_id: ROOM,
            policy: quick_policy(3),
        },
        sink.clone(),
    );

    let mut status = subscriber.status();
    while *status.borrow_and_update() != FeedStatus::Degraded {
        status.changed().await.expect("status channel");
    }
    // No further dials once degraded.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 3);
    assert!(sink.inserts.lock().await.is_empty());
    subscriber.close().await;
}

#[tokio::test]
async fn close_cancels_a_pending_reconnect() {
    let (url, _accepts) = spawn_refusing_server().await.expect("spawn server");

    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: url,
            room_id: ROOM,
            policy: ReconnectPolicy {
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                max_attempts: 5,
            },
        },
        sink,
    );

    let mut status = subscriber.status();
    while *status.borrow_and_update() != FeedStatus::Errored {
        status.changed().await.expect("status channel");
    }
    tokio::time::timeout(Duration::from_secs(1), subscriber.close())
        .await
        .expect("close must not wait out the backoff");
}

#[tokio::test]
async fn unsupported_url_scheme_degrades_without_dialing() {
    let sink = Arc::new(RecordingSink::default());
    let subscriber = ChangeFeedSubscriber::open(
        ChangeFeedOptions {
            feed_url: "ftp://example.invalid".to_string(),
            room_id: ROOM,
            policy: quick_policy(2),
        },
        sink,
    );

    let mut status = subscriber.status();
    while *status.borrow_and_update() != FeedStatus::Degraded {
        status.changed().await.expect("status channel");
    }
    subscriber.close().await;
}
