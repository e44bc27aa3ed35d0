use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info};

mod aggregate;
mod bus;
mod chat;
mod config;
mod entity;
mod error;
mod inbox;
mod interface;
mod merge;
mod realtime;
mod retry;
mod store;
mod view;

use crate::chat::{ConversationSummary, DeliveryStatus, Message, MessageId, NewMessage};
use crate::config::{Backend, Config};
use crate::entity::SenderRole;
use crate::inbox::Inbox;
use crate::interface::{http::HttpApi, terminal};
use crate::realtime::{ChangeFeed, RealtimeClient, RealtimeConfig};
use crate::store::{RestStore, SqliteStore, StoreClient};

#[derive(Parser)]
#[command(name = "whatsview", version, about = "Browse and follow WhatsApp-style conversations")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations, most recent first.
    List {
        #[arg(long)]
        search: Option<String>,
    },
    /// Print every message of one conversation.
    Show { phone: String },
    /// Insert a message.
    Send {
        phone: String,
        text: String,
        #[arg(long, default_value = "user")]
        sender: SenderRole,
    },
    /// Move a message's delivery status forward.
    Mark { id: String, status: DeliveryStatus },
    /// Follow the conversation list and one conversation live.
    Watch { phone: Option<String> },
    /// Serve the HTTP/SSE API.
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

/// Store and change feed for the configured backend.
struct Wiring {
    client: StoreClient,
    feed: Arc<dyn ChangeFeed>,
    realtime: Option<Arc<RealtimeClient>>,
    sqlite: Option<SqliteStore>,
}

impl Wiring {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        match &config.backend {
            Backend::Supabase { url, anon_key } => {
                info!("Connecting to hosted backend at {}", url);
                let store = RestStore::new(url.clone(), anon_key.clone(), config.table.clone())?;
                let mut realtime_config = RealtimeConfig::new(url.clone(), anon_key.clone());
                realtime_config.retry = config.reconnect.clone();
                let realtime = Arc::new(RealtimeClient::connect(realtime_config));
                Ok(Self {
                    client: StoreClient::new(Arc::new(store)),
                    feed: realtime.clone(),
                    realtime: Some(realtime),
                    sqlite: None,
                })
            }
            Backend::Sqlite { path } => {
                info!("Initializing store at {}", path.display());
                let bus = bus::EventBus::new();
                let store = SqliteStore::new(path, config.table.clone(), bus.clone())
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                Ok(Self {
                    client: StoreClient::new(Arc::new(store.clone())),
                    feed: Arc::new(bus),
                    realtime: None,
                    sqlite: Some(store),
                })
            }
        }
    }

    async fn close(&self) {
        if let Some(realtime) = &self.realtime {
            realtime.close().await;
        }
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let wiring = Wiring::connect(&config).await?;
    let inbox = Arc::new(Inbox::new(wiring.client.clone(), wiring.feed.clone(), config.list_options()));

    let result = match cli.command.unwrap_or(Command::Watch { phone: None }) {
        Command::List { search } => {
            let summaries = inbox.conversation_summaries().await;
            let summaries = aggregate::filter_summaries(&summaries, search.as_deref().unwrap_or(""));
            print!("{}", terminal::render_conversation_list(&summaries, &chrono::Local::now()));
            Ok(())
        }
        Command::Show { phone } => {
            let messages = inbox.messages(&phone).await;
            print!("{}", terminal::render_conversation(&phone, &messages, &chrono::Local));
            Ok(())
        }
        Command::Send { phone, text, sender } => inbox
            .insert_message(NewMessage::new(phone, text, sender))
            .await
            .map(|created| println!("{}", created.id))
            .map_err(Into::into),
        Command::Mark { id, status } => inbox
            .mark_status(&MessageId::new(id), status)
            .await
            .map(|updated| println!("{} {}", updated.id, updated.status))
            .map_err(Into::into),
        Command::Watch { phone } => watch(&inbox, phone).await,
        Command::Serve { addr } => serve(&inbox, addr.unwrap_or(config.http_addr)).await,
    };

    inbox.shutdown().await;
    wiring.close().await;
    result
}

async fn watch(inbox: &Inbox, phone: Option<String>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<ConversationSummary>>();
    inbox
        .on_conversations_changed(Arc::new(move |summaries: &[ConversationSummary]| {
            let _ = tx.send(summaries.to_vec());
        }))
        .await?;

    if let Some(phone) = phone {
        select_conversation(inbox, &phone).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            received = rx.recv() => {
                let Some(summaries) = received else { break };
                println!("{}", terminal::render_conversation_list(&summaries, &chrono::Local::now()));
                if inbox.selected_phone().await.is_none() {
                    if let Some(first) = summaries.first() {
                        select_conversation(inbox, &first.phone_number).await?;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn select_conversation(inbox: &Inbox, phone: &str) -> anyhow::Result<()> {
    inbox
        .on_messages_changed(
            phone,
            Arc::new(|phone: &str, messages: &[Message]| {
                println!("{}", terminal::render_conversation(phone, messages, &chrono::Local));
            }),
        )
        .await?;
    Ok(())
}

async fn serve(inbox: &Arc<Inbox>, addr: SocketAddr) -> anyhow::Result<()> {
    let api = HttpApi::new(inbox.clone());
    api.start_feed().await?;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, api.router()) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }
    Ok(())
}
