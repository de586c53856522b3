use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatSession, ConnectionEvent, EventFilter, StaticCredentials};
use shared::domain::{ConversationId, ConversationKind, Counterpart, UserId};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_base_url` from client.toml / environment.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    cache_db: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, env = "CHAT_ACCESS_TOKEN")]
    token: Option<String>,
    /// Conversation to open and send `--text` to.
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long)]
    group: bool,
    #[arg(long)]
    text: Option<String>,
    /// How long to keep printing push events before exiting.
    #[arg(long, default_value_t = 30)]
    tail_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = Some(ws_url);
    }
    if let Some(cache_db) = args.cache_db {
        settings.cache_database_url = client_core::config::normalize_database_url(&cache_db);
    }

    let cache = Storage::new(&settings.cache_database_url)
        .await
        .with_context(|| format!("failed to open cache at {}", settings.cache_database_url))?;
    let session = ChatSession::from_settings(
        &settings,
        UserId::new(args.user_id),
        Arc::new(StaticCredentials::new(args.token.clone())),
        Arc::new(cache),
    )?;

    let _events = session
        .connection()
        .subscribe(EventFilter::All, |event| match event {
            ConnectionEvent::Status(state) => println!("connection: {state:?}"),
            ConnectionEvent::Server(event) => println!("event: {:?}", event.kind()),
        });

    session.start(args.token).await;

    for kind in [ConversationKind::Direct, ConversationKind::Group] {
        let registry = session.registry(kind);
        if let Some(err) = registry.list_error().await {
            println!("{kind:?} list unavailable: {err}");
        }
        for conversation in registry.conversations() {
            let title = match &conversation.counterpart {
                Counterpart::Peer { peer } => peer.username.clone(),
                Counterpart::Members { name, .. } => name.clone(),
            };
            println!(
                "{kind:?} {} {title} unread={}",
                conversation.id, conversation.unread_count
            );
        }
    }

    if let Some(conversation) = args.conversation {
        let kind = if args.group {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        };
        let id = ConversationId::new(conversation);
        session.focus_conversation(kind, &id).await;
        if let Err(err) = session.load_older(kind, &id).await {
            println!("could not load messages: {err}");
        }
        let store = session.registry(kind).store(&id).await;
        for message in store.messages().await {
            println!("  [{:?}] {:?}", message.status(), message.key());
        }
        if let Some(text) = args.text {
            let client_msg_id = session.send_message(kind, &id, Some(text), None).await?;
            println!("sent {client_msg_id}");
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(args.tail_secs)) => {}
    }
    info!("shutting down");
    session.shutdown();
    Ok(())
}
