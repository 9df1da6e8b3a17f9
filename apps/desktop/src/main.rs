use std::{io::Write as _, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    ChangeFeedOptions, ChatEvent, ChatMessage, ChatSyncEngine, HttpMessageStore, InboundNotifier,
    ReconnectPolicy,
};
use shared::domain::{MessageKind, RoomId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the message-store API.
    #[arg(long)]
    store_url: String,
    /// Base URL of the change-feed service.
    #[arg(long)]
    feed_url: String,
    #[arg(long)]
    room_id: i64,
    #[arg(long)]
    user_id: i64,
}

struct TerminalBell;

impl InboundNotifier for TerminalBell {
    fn message_received(&self) {
        print!("\x07");
        let _ = std::io::stdout().flush();
    }
}

fn print_message(message: &ChatMessage) {
    let sender = message
        .sender_name
        .clone()
        .unwrap_or_else(|| format!("user {}", message.sender_id.0));
    println!("[{}] {}: {}", message.created_at, sender, message.content);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store = Arc::new(HttpMessageStore::new(args.store_url));
    let engine = ChatSyncEngine::new_with_notifier(
        RoomId(args.room_id),
        UserId(args.user_id),
        store,
        Arc::new(TerminalBell),
    );

    let count = engine.load().await?;
    println!("Joined room {} ({count} messages)", args.room_id);
    for message in engine.messages().await {
        print_message(&message);
    }
    engine.mark_as_read().await?;

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChatEvent::MessageReceived { message }) => print_message(&message),
                Ok(ChatEvent::MessageConfirmed { message, .. }) => {
                    println!("(delivered) {}", message.content)
                }
                Ok(ChatEvent::MessageFailed { reason, .. }) => {
                    println!("(send failed: {reason})")
                }
                Ok(ChatEvent::MessageEdited { message_id }) => {
                    println!("(message {} was edited)", message_id.0)
                }
                Ok(ChatEvent::FeedStatusChanged(status)) => {
                    println!("(feed: {status:?})")
                }
                Ok(ChatEvent::Error(message)) => println!("(error: {message})"),
                Ok(ChatEvent::MessagesLoaded { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer lagged behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let feed = Arc::clone(&engine).attach_feed(ChangeFeedOptions {
        feed_url: args.feed_url,
        room_id: engine.room_id(),
        policy: ReconnectPolicy::default(),
    });

    println!("Type a message and press enter to send; /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if let Err(err) = engine.send(line, MessageKind::Text, Vec::new()).await {
            warn!("send failed: {err:#}");
        }
    }

    feed.close().await;
    Ok(())
}
