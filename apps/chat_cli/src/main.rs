use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_settings, connect_realtime, ChannelEntry, ChannelKind, ChatSession, SearchQuery,
    SessionEvent,
};
use futures::StreamExt;
use shared::{
    domain::{ChannelId, MentionId},
    protocol::Message,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Channels,
    Messages {
        channel_id: String,
        /// Extra older pages to load after the latest one.
        #[arg(long, default_value_t = 0)]
        older_pages: u32,
    },
    Mentions {
        #[arg(long, default_value_t = 1)]
        pages: u32,
        #[arg(long)]
        mark_read: Option<String>,
        #[arg(long)]
        hide: Option<String>,
    },
    Search {
        text: String,
        #[arg(long)]
        channel_id: Option<String>,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    Members {
        channel_id: String,
    },
    /// Streams realtime updates for a channel until interrupted.
    Watch {
        channel_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref());
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    settings.validate().context("invalid client settings")?;
    let session = ChatSession::from_settings(&settings);

    match cli.command {
        Command::Channels => {
            let entries = session.load_channel_list().await?;
            for entry in entries.iter() {
                print_channel(entry);
            }
        }
        Command::Messages {
            channel_id,
            older_pages,
        } => {
            session.open_channel(ChannelId::new(channel_id)).await?;
            for _ in 0..older_pages {
                if !session.load_older().await? {
                    break;
                }
            }
            for message in session.messages().await.iter() {
                print_message(message);
            }
        }
        Command::Mentions {
            pages,
            mark_read,
            hide,
        } => {
            for _ in 0..pages {
                if !session.load_more_mentions().await? {
                    break;
                }
            }
            if let Some(id) = mark_read {
                session.mark_mention_read(&MentionId::new(id)).await?;
            }
            if let Some(id) = hide {
                session.hide_mention(&MentionId::new(id)).await?;
            }
            for mention in session.mentions().await {
                let marker = if mention.is_read { " " } else { "*" };
                println!(
                    "{marker} {} #{} {}: {}",
                    mention.name,
                    mention.channel_name.as_deref().unwrap_or(mention.channel_id.as_str()),
                    mention.owner,
                    mention.text.as_deref().unwrap_or_default()
                );
            }
            println!("unread mentions: {}", session.mention_unread_count().await);
        }
        Command::Search {
            text,
            channel_id,
            pages,
        } => {
            let mut results = session.search(SearchQuery {
                text,
                channel_id: channel_id.map(ChannelId::new),
            });
            for _ in 0..pages {
                if !results.load_more().await? {
                    break;
                }
            }
            for message in results.results() {
                print_message(message);
            }
            if !results.pager().is_exhausted() {
                println!("(more results available)");
            }
        }
        Command::Members { channel_id } => {
            for member in session.fetch_members(&ChannelId::new(channel_id)).await? {
                let admin = if member.is_admin { " (admin)" } else { "" };
                println!("{} <{}>{admin}", member.full_name, member.name);
            }
        }
        Command::Watch { channel_id } => {
            session.load_channel_list().await?;
            if let Some(channel_id) = channel_id {
                session.open_channel(ChannelId::new(channel_id)).await?;
            }
            let coalescer = session.spawn_coalescer();
            let realtime = connect_realtime(&session, &settings).await?;
            let mut events = BroadcastStream::new(session.subscribe_events());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => render_event(&session, event).await,
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            warn!(skipped, "cli: event stream lagged");
                        }
                        None => break,
                    },
                }
            }
            realtime.abort();
            coalescer.abort();
        }
    }

    Ok(())
}

async fn render_event(session: &ChatSession, event: SessionEvent) {
    match event {
        SessionEvent::ChannelListChanged => {
            println!("-- channels (unread {})", session.total_unread().await);
            for entry in session.channels().await.iter().take(10) {
                print_channel(entry);
            }
        }
        SessionEvent::MessagesChanged { channel_id } => {
            if session.active_channel().await.as_ref() != Some(&channel_id) {
                return;
            }
            println!("-- #{channel_id}");
            for message in session.messages().await.iter().take(10) {
                print_message(message);
            }
        }
        SessionEvent::MentionsChanged => {
            println!("-- mentions (unread {})", session.mention_unread_count().await);
        }
        SessionEvent::MembersChanged { channel_id } => {
            println!("-- members of #{channel_id} changed");
        }
        SessionEvent::Error(message) => eprintln!("!! {message}"),
    }
}

fn print_channel(entry: &ChannelEntry) {
    let prefix = match &entry.kind {
        ChannelKind::Channel(_) => "#",
        ChannelKind::Direct { .. } => "@",
    };
    let unread = if entry.unread_count > 0 {
        format!(" ({})", entry.unread_count)
    } else {
        String::new()
    };
    let preview = entry
        .last_message
        .as_ref()
        .map(|summary| summary.content.as_str())
        .unwrap_or_default();
    println!("{prefix}{}{unread} {preview}", entry.display_name);
}

fn print_message(message: &Message) {
    let edited = if message.is_edited { " (edited)" } else { "" };
    println!(
        "[{}] {}: {}{edited}",
        message.creation.format("%Y-%m-%d %H:%M"),
        message.owner,
        message.display_text()
    );
}
