#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

mod utils;

use parley::config::{self, ClientConfig};
use parley::store::{make_row, RemoteStore, Table};
use parley::sync::conversations::{self, available_profiles, search_conversations};
use parley::sync::messages::{self, NewMessage};
use parley::sync::profiles::{fetch_profiles, ProfileDirectory};
use parley::sync::receipts::{self, StatusPolicy};
use parley::{
    ChatClient, DeliveryStatus, IdentityProvider, LocalIdentity, MemoryStore, MessageKind, MessageWithDetails,
    Profile, SharedStore, SqliteStore, SyncNotice, SyncOptions,
};

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: a chat client kept in sync with a shared store.",
    long_about = "parley keeps a local view of one user's conversations, messages and receipts \
    in sync with a shared store.\n\n\
    The acting user comes from --user, PARLEY_USER or the config file."
)]
struct Args {
    /// Database file (defaults to parley.db in the config directory)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Acting user id
    #[arg(long, value_name = "UUID")]
    user: Option<Uuid>,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a profile
    AddProfile {
        username: String,
        /// Display name (defaults to the username)
        #[arg(long)]
        name: Option<String>,
        /// Save the new id as the default user in the config file
        #[arg(long)]
        make_default: bool,
    },
    /// List profiles and presence
    Profiles {
        /// Only profiles without a conversation with the acting user
        #[arg(long)]
        available: bool,
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Find or create the 1:1 conversation with another user
    ChatWith { other: Uuid },
    /// List the acting user's conversations, most recent first
    Conversations {
        #[arg(long, default_value = "")]
        search: String,
    },
    /// Send a message
    Send {
        conversation: Uuid,
        content: String,
        #[arg(long, default_value = "text")]
        kind: MessageKind,
        #[arg(long)]
        reply_to: Option<Uuid>,
    },
    /// Print a conversation timeline
    History { conversation: Uuid },
    /// Mark a message read by the acting user
    Read {
        message: Uuid,
        #[arg(long)]
        policy: Option<StatusPolicy>,
    },
    /// Set the acting user online or offline
    Presence {
        #[arg(value_parser = ["online", "offline"])]
        state: String,
    },
    /// Run the two-user scenario against an in-memory store
    Demo,
    /// Open a live session and log changes until Ctrl-C
    Watch {
        /// Conversation to follow
        #[arg(long)]
        conversation: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }
    let mut cfg = config::load_config()?;
    if let Some(db) = &args.db {
        cfg.database_path = Some(db.clone());
    }
    if let Some(user) = args.user {
        cfg.user_id = Some(user);
    }
    let level = match &args.log_level {
        Some(level) => config::parse_level(level).ok_or_else(|| anyhow!("unknown log level '{}'", level))?,
        None => cfg.level_filter(),
    };
    utils::setup_logging(cfg.log_file.as_deref(), level)?;

    if let Command::Demo = args.command {
        return run_demo().await;
    }

    let db_path = cfg.database_path()?;
    debug!("Opening store at {}", db_path.display());
    let store: SharedStore = Arc::new(SqliteStore::open(&db_path)?);

    match args.command {
        Command::AddProfile { username, name, make_default } => {
            let id = add_profile(&*store, &username, name.as_deref().unwrap_or(&username)).await?;
            println!("{}", id);
            if make_default {
                cfg.user_id = Some(id);
                config::save_config(&cfg)?;
            }
        }
        Command::Profiles { available, search } => {
            let profiles = fetch_profiles(&*store).await?;
            let shown = if available {
                let me = acting_user(&cfg)?;
                let summaries = conversations::fetch_conversations(&*store, me).await?;
                available_profiles(&profiles, &summaries, me, &search)
            } else {
                available_profiles(&profiles, &[], Uuid::nil(), &search)
            };
            for profile in &shown {
                print_profile(profile, &cfg);
            }
        }
        Command::ChatWith { other } => {
            let conversation = conversations::create_or_get(&*store, acting_user(&cfg)?, other).await?;
            println!("{}", conversation.id);
        }
        Command::Conversations { search } => {
            let me = acting_user(&cfg)?;
            let summaries = conversations::fetch_conversations(&*store, me).await?;
            for summary in search_conversations(&summaries, me, &search) {
                let title = summary
                    .conversation
                    .name
                    .clone()
                    .or_else(|| summary.other_participant(me).and_then(|p| p.profile.as_ref()).map(|p| p.display_name.clone()))
                    .unwrap_or_else(|| "(unnamed)".to_string());
                let last = summary
                    .last_message
                    .as_ref()
                    .map(|m| m.message.content.as_str())
                    .unwrap_or("");
                println!("{}  {:<24} {}", summary.id(), title, last);
            }
        }
        Command::Send { conversation, content, kind, reply_to } => {
            let mut message = NewMessage::text(content).with_kind(kind);
            if let Some(parent) = reply_to {
                message = message.reply_to(parent);
            }
            let sent = messages::send_message(&*store, acting_user(&cfg)?, conversation, message).await?;
            println!("{} ({} receipt(s))", sent.id(), sent.statuses.len());
        }
        Command::History { conversation } => {
            let me = cfg.user_id;
            for message in messages::list_messages(&*store, conversation).await? {
                print_message(&message, me);
            }
        }
        Command::Read { message, policy } => {
            let policy = policy.unwrap_or(cfg.status_policy);
            let outcome = receipts::mark_read(&*store, policy, message, acting_user(&cfg)?).await?;
            println!("{}", outcome.status().as_str());
        }
        Command::Presence { state } => {
            let (tx, _) = broadcast::channel(1);
            let directory = ProfileDirectory::new(store.clone(), tx);
            let profile = directory.update_online_status(acting_user(&cfg)?, state == "online").await?;
            print_profile(&profile, &cfg);
        }
        Command::Watch { conversation } => run_watch(store, &cfg, conversation).await?,
        Command::Demo => {}
    }

    Ok(())
}

fn acting_user(cfg: &ClientConfig) -> Result<Uuid> {
    cfg.user_id
        .ok_or_else(|| anyhow!("no acting user; pass --user, set PARLEY_USER or save one in the config"))
}

async fn add_profile(store: &dyn RemoteStore, username: &str, display_name: &str) -> Result<Uuid> {
    if username.trim().is_empty() {
        return Err(anyhow!("username cannot be empty"));
    }
    let row = store
        .insert(
            Table::Profiles,
            make_row([("username", json!(username)), ("full_name", json!(display_name))]),
        )
        .await?;
    let id = row
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("store returned a profile without an id"))?;
    let id = Uuid::parse_str(id).context("store returned a malformed profile id")?;
    info!("Created profile {} ({})", username, id);
    Ok(id)
}

fn print_profile(profile: &Profile, cfg: &ClientConfig) {
    let online = profile.is_effectively_online(Utc::now(), cfg.presence_stale_after());
    println!(
        "{}  {:<20} @{:<16} {}",
        profile.id,
        profile.display_name,
        profile.username,
        if online { "online" } else { "offline" }
    );
}

fn print_message(message: &MessageWithDetails, viewer: Option<Uuid>) {
    let sender = message
        .sender
        .as_ref()
        .map(|p| p.display_name.clone())
        .unwrap_or_else(|| message.message.sender_id.to_string());
    let ticks = match viewer.and_then(|v| message.aggregate_status(v)) {
        Some(DeliveryStatus::Read) => " [read]",
        Some(DeliveryStatus::Delivered) => " [delivered]",
        Some(DeliveryStatus::Sent) => " [sent]",
        None => "",
    };
    println!(
        "{} {}: {}{}",
        message.message.created_at.format("%Y-%m-%d %H:%M:%S"),
        sender,
        message.message.content,
        ticks
    );
}

async fn run_watch(store: SharedStore, cfg: &ClientConfig, conversation: Option<Uuid>) -> Result<()> {
    let user = acting_user(cfg)?;
    let client = Arc::new(ChatClient::new(store, cfg.sync_options()));
    let mut notices = client.notices();

    let identity = Arc::new(LocalIdentity::new());
    let follower = client.clone().follow(identity.clone() as Arc<dyn IdentityProvider>);
    identity.sign_in(user);

    // Let the session come up before selecting a conversation.
    while client.context().await.is_none() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if let Some(conversation) = conversation {
        client.select_conversation(Some(conversation)).await?;
    }
    info!("Watching as {}; press Ctrl-C to stop", user);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(SyncNotice::ProfilesChanged) => println!("profiles changed"),
                Ok(SyncNotice::ConversationsChanged) => {
                    for summary in client.conversations().await? {
                        let last = summary.last_message.map(|m| m.message.content).unwrap_or_default();
                        println!("  {} {}", summary.conversation.id, last);
                    }
                }
                Ok(SyncNotice::MessagesChanged { conversation_id }) => {
                    println!("messages changed in {}", conversation_id);
                    for message in client.messages().await.unwrap_or_default() {
                        print_message(&message, Some(user));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} notices", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    identity.sign_out();
    client.end_session().await;
    follower.abort();
    Ok(())
}

async fn run_demo() -> Result<()> {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let alice_id = add_profile(&*store, "alice", "Alice").await?;
    let bob_id = add_profile(&*store, "bob", "Bob").await?;

    let options = SyncOptions::default();
    let alice = ChatClient::new(store.clone(), options.clone());
    let bob = ChatClient::new(store.clone(), options);
    alice.begin_session(alice_id).await;
    bob.begin_session(bob_id).await;

    let conversation = alice.start_conversation(bob_id).await?;
    println!("conversation {}", conversation.id);

    alice.select_conversation(Some(conversation.id)).await?;
    let sent = alice.send("hi").await?;
    println!("alice sent '{}' to {} recipient(s)", sent.message.content, sent.statuses.len());
    println!(
        "bob's receipt: {}",
        receipts::status_of(&*store, sent.id(), bob_id).await?.as_str()
    );

    bob.select_conversation(Some(conversation.id)).await?;
    let marked = bob.mark_all_read().await?;
    println!("bob marked {} message(s) read", marked);
    println!(
        "bob's receipt: {}",
        receipts::status_of(&*store, sent.id(), bob_id).await?.as_str()
    );

    // Push events are delivered asynchronously.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for summary in alice.conversations().await? {
        let last = summary.last_message.as_ref().map(|m| m.message.content.as_str()).unwrap_or("");
        println!("alice's list: {} last='{}'", summary.id(), last);
    }
    for message in alice.messages().await? {
        print_message(&message, Some(alice_id));
    }

    bob.end_session().await;
    alice.end_session().await;
    println!("{} subscription(s) left open", memory.subscriber_count());
    Ok(())
}
