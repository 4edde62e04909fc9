use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    load_settings, AdminApi, ChannelStatus, ClientEvent, ListQuery, MessageChannel, RequestClient,
};
use shared::domain::{
    AdminResource, ChatMessage, ComplaintId, ConversationId, MessageType, ThreadRef,
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(about = "Operator CLI for the rental admin backend")]
struct Cli {
    /// Settings file; defaults to ./admin.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct ThreadArgs {
    #[arg(long)]
    conversation: Option<i64>,
    #[arg(long)]
    complaint: Option<i64>,
}

impl ThreadArgs {
    fn thread(&self) -> Result<ThreadRef> {
        match (self.conversation, self.complaint) {
            (Some(id), None) => Ok(ThreadRef::Conversation(ConversationId(id))),
            (None, Some(id)) => Ok(ThreadRef::Complaint(ComplaintId(id))),
            _ => bail!("pass exactly one of --conversation or --complaint"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    List {
        resource: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        search: Option<String>,
    },
    Get {
        resource: String,
        id: i64,
    },
    Delete {
        resource: String,
        id: i64,
    },
    /// Print the latest history of a thread, then stream new messages.
    Tail {
        #[command(flatten)]
        thread: ThreadArgs,
    },
    Send {
        #[command(flatten)]
        thread: ThreadArgs,
        text: String,
    },
}

fn parse_resource(raw: &str) -> Result<AdminResource> {
    AdminResource::parse(raw).ok_or_else(|| {
        let known: Vec<&str> = AdminResource::ALL.iter().map(|r| r.name()).collect();
        anyhow!("unknown resource `{raw}`; expected one of: {}", known.join(", "))
    })
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] #{} user={}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.id,
        message.sender_id,
        message.content
    );
}

fn spawn_event_printer(mut events: broadcast::Receiver<ClientEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Notification(notice)) => {
                    eprintln!("{:?}: {}", notice.level, notice.text);
                }
                Ok(ClientEvent::RedirectToLogin { route }) => {
                    eprintln!("session ended; sign in again ({route})");
                }
                Ok(ClientEvent::ChannelStatusChanged { thread, status }) => {
                    info!(%thread, ?status, "channel status");
                }
                Ok(ClientEvent::SessionExpired) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn wait_until_open(channel: &MessageChannel) -> Result<()> {
    let mut status = channel.watch_status();
    let reached = tokio::time::timeout(
        OPEN_TIMEOUT,
        status.wait_for(|s| matches!(s, ChannelStatus::Open | ChannelStatus::Closed)),
    )
    .await
    .context("timed out connecting to chat")?
    .map(|s| *s)
    .context("channel task ended")?;
    if reached != ChannelStatus::Open {
        bail!("chat connection failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref())?;
    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    let client = Arc::new(RequestClient::new(settings, storage)?);
    spawn_event_printer(client.subscribe_events());
    let api = AdminApi::new(Arc::clone(&client));

    match cli.command {
        Command::Login { email, password } => {
            let profile = client.login(&email, &password).await?;
            println!(
                "signed in as {} ({:?}) user_id={}",
                profile.email, profile.role, profile.id
            );
        }
        Command::Logout => {
            client.logout().await?;
            println!("signed out");
        }
        Command::Whoami => match client.current_user().await {
            Ok(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
            Err(err) if err.is_unauthorized() => println!("not signed in"),
            Err(err) => return Err(err.into()),
        },
        Command::List {
            resource,
            page,
            limit,
            search,
        } => {
            let resource = parse_resource(&resource)?;
            let query = ListQuery {
                search,
                ..ListQuery::page(page, limit)
            };
            let listing = api.list(resource, &query).await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Command::Get { resource, id } => {
            let item = api.get(parse_resource(&resource)?, id).await?;
            println!("{}", serde_json::to_string_pretty(&item)?);
        }
        Command::Delete { resource, id } => {
            api.delete(parse_resource(&resource)?, id).await?;
            println!("deleted {resource} #{id}");
        }
        Command::Tail { thread } => {
            let channel = MessageChannel::open(Arc::clone(&client), thread.thread()?).await?;
            channel.load_initial().await?;
            for message in channel.messages().await {
                print_message(&message);
            }
            channel
                .on_message(|arrival| print_message(&arrival.message))
                .await;

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            channel.close().await;
        }
        Command::Send { thread, text } => {
            let channel = MessageChannel::open(Arc::clone(&client), thread.thread()?).await?;
            let (echo_tx, mut echo_rx) = tokio::sync::mpsc::unbounded_channel();
            channel
                .on_message(move |arrival| {
                    let _ = echo_tx.send(arrival.message.clone());
                })
                .await;
            wait_until_open(&channel).await?;

            channel.send(MessageType::Text, text.clone()).await?;
            let echoed = tokio::time::timeout(ECHO_TIMEOUT, async {
                while let Some(message) = echo_rx.recv().await {
                    if message.content == text {
                        return Some(message);
                    }
                }
                None
            })
            .await;
            match echoed {
                Ok(Some(message)) => print_message(&message),
                _ => warn!("message sent but no echo arrived"),
            }
            channel.close().await;
        }
    }

    Ok(())
}
