use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use client_core::{
    transport::{HttpMessageApi, WebSocketLiveChannel},
    ConversationEvent, Draft, MissingMediaUploader, StaticSession, SyncClient,
};
use shared::domain::{ConversationId, Message, MessageStatus, UserId};
use storage::Storage;

mod config;
use config::load_settings;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user: String,
    #[arg(long)]
    conversation: String,
    #[arg(long)]
    token: Option<String>,
}

fn render_line(message: &Message) -> String {
    let marker = match message.status {
        MessageStatus::Pending => " …",
        MessageStatus::Failed => " ✗",
        MessageStatus::Retracted => return format!("{}: [message deleted]", message.sender_id),
        MessageStatus::Sent => "",
    };
    format!(
        "[{}] {}: {}{marker}",
        message.created_at.format("%H:%M:%S"),
        message.sender_id,
        message.content
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let settings = load_settings();
    let server_url = args.server_url.unwrap_or(settings.server_url);

    let session = Arc::new(match args.token {
        Some(token) => StaticSession::with_token(UserId::new(&args.user), token),
        None => StaticSession::new(UserId::new(&args.user)),
    });
    let storage = Storage::new(&settings.database_url).await?;

    let client = SyncClient::new_with_dependencies(
        Arc::new(WebSocketLiveChannel::new(
            server_url.clone(),
            session.clone(),
        )),
        Arc::new(HttpMessageApi::new(server_url, session.clone())),
        Arc::new(MissingMediaUploader),
        session,
        Some(storage),
    );

    let conversation_id = ConversationId::new(&args.conversation);
    let handle = client.open(conversation_id.clone()).await?;

    let mut watcher = handle.watch_messages();
    tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let messages = watcher.borrow_and_update().clone();
            if let Some(latest) = messages.last() {
                println!("{}", render_line(latest));
            }
        }
    });

    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConversationEvent::TypingChanged { names }) if !names.is_empty() => {
                    println!("~ {} typing…", names.join(", "));
                }
                Ok(ConversationEvent::MessageFailed { reason, .. }) => {
                    println!("! send failed: {reason}");
                }
                Ok(ConversationEvent::LinkChanged(state)) => {
                    println!("~ link {state:?}");
                }
                Ok(ConversationEvent::SyncDegraded {
                    consecutive_failures,
                }) => {
                    println!("~ connection degraded ({consecutive_failures} failed refreshes)");
                }
                Ok(ConversationEvent::AuthRequired { context }) => {
                    println!("! sign-in required ({context})");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    for message in handle.messages() {
        println!("{}", render_line(&message));
    }
    println!("-- type a message and press enter; /refresh re-syncs, /quit exits --");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => {}
            "/quit" => break,
            "/refresh" => handle.refresh().await?,
            _ => {
                if let Err(err) = handle.submit(Draft::text(line)).await {
                    println!("! rejected: {err:#}");
                }
            }
        }
    }

    client.close(&conversation_id).await?;
    client.shutdown().await;
    Ok(())
}
