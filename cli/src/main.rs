// peerlink — command-line front end
//
// Runs the coordination relay, manages the local identity and contacts,
// and hosts an interactive chat session over the relay tunnel.

mod chat;
mod config;
mod contacts;
mod history;
mod server;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use peerlink_core::store::{MessageDirection, MessageKind};
use peerlink_core::{ChatMessage, Contact, ContactStore, PeerIdentity};
use std::net::SocketAddr;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "PeerLink — direct peer messaging through a tiny relay", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local identity
    Init {
        /// Display name shown to contacts
        #[arg(short, long)]
        name: String,
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Show identity information
    Identity,
    /// Manage contacts
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// View message history
    History {
        #[arg(short, long)]
        peer: Option<String>,
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Run the coordination relay
    Relay {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
    /// Start an interactive chat session
    Chat,
}

#[derive(Subcommand)]
enum ContactAction {
    Add {
        peer_id: String,
        #[arg(short, long)]
        name: Option<String>,
    },
    List,
    Show { contact: String },
    Remove { contact: String },
    Search { query: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { name, force } => cmd_init(name, force),
        Commands::Identity => cmd_identity(),
        Commands::Contact { action } => cmd_contact(action),
        Commands::Config { action } => cmd_config(action),
        Commands::History {
            peer,
            search,
            limit,
        } => cmd_history(peer, search, limit),
        Commands::Relay { port, host } => cmd_relay(host, port).await,
        Commands::Chat => {
            let config = config::Config::load()?;
            chat::run(&config).await
        }
    }
}

fn cmd_init(name: String, force: bool) -> Result<()> {
    println!("{}", "Initializing PeerLink...".bold());
    println!();

    let mut config = config::Config::load()?;
    println!("  {} Configuration", "✓".green());

    if let Some(existing) = &config.identity {
        if !force {
            println!(
                "  {} Identity already exists: {} ({})",
                "•".yellow(),
                existing.display_name.bright_cyan(),
                existing.id
            );
            println!("    Use {} to replace it", "--force".bright_green());
            return Ok(());
        }
    }

    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Display name must not be empty");
    }
    let identity = PeerIdentity::generate(name);
    config.identity = Some(identity.clone());
    config.save()?;

    let data_dir = config.data_dir()?;
    println!("  {} Data directory: {}", "✓".green(), data_dir.display());
    println!("  {} Identity created", "✓".green());
    println!();

    println!("{}", "Identity Information:".bold());
    println!("  ID:   {}", identity.id.bright_cyan());
    println!("  Name: {}", identity.display_name.bright_yellow());
    println!();

    println!("{}", "Next steps:".bold());
    println!(
        "  • Share your ID with a friend, or add theirs: {}",
        "peerlink contact add <peer-id> --name <name>".bright_green()
    );
    println!("  • Start chatting: {}", "peerlink chat".bright_green());

    Ok(())
}

fn cmd_identity() -> Result<()> {
    let config = config::Config::load()?;
    let identity = config.require_identity()?;

    println!("{}", "Identity Information".bold());
    println!("  ID:   {}", identity.id.bright_cyan());
    println!("  Name: {}", identity.display_name.bright_yellow());
    Ok(())
}

fn open_contacts(config: &config::Config) -> Result<contacts::SledContactStore> {
    contacts::SledContactStore::open(config.data_dir()?.join("contacts"))
}

fn find_contact(contacts: &contacts::SledContactStore, query: &str) -> Result<Contact> {
    contacts
        .find(query)?
        .with_context(|| format!("Contact not found: {}", query))
}

fn cmd_contact(action: ContactAction) -> Result<()> {
    let config = config::Config::load()?;
    let contacts = open_contacts(&config)?;

    match action {
        ContactAction::Add { peer_id, name } => {
            if config.identity.as_ref().is_some_and(|id| id.id == peer_id) {
                anyhow::bail!("That is your own peer ID");
            }
            let name = name.unwrap_or_else(|| peer_id.clone());
            contacts.upsert(Contact::new(peer_id.clone(), name.clone()))?;

            println!("{} Contact added:", "✓".green());
            println!("  Name:    {}", name.bright_cyan());
            println!("  Peer ID: {}", peer_id);
        }

        ContactAction::List => {
            let list = contacts.get_all()?;

            if list.is_empty() {
                println!("{}", "No contacts yet.".dimmed());
            } else {
                println!("{} ({} total)", "Contacts".bold(), list.len());
                println!();

                for contact in list {
                    println!(
                        "  {} {} [{}]",
                        "•".bright_green(),
                        contact.display_name.bright_cyan(),
                        contact.presence.as_str()
                    );
                    println!("    Peer ID: {}", contact.peer_id.dimmed());
                }
            }
        }

        ContactAction::Show { contact: query } => {
            let contact = find_contact(&contacts, &query)?;

            println!("{}", "Contact Details".bold());
            println!("  Name:      {}", contact.display_name.bright_cyan());
            println!("  Peer ID:   {}", contact.peer_id);
            println!("  Presence:  {}", contact.presence.as_str());
            println!("  Added:     {}", format_timestamp(contact.added_at));
            if let Some(last_seen) = contact.last_seen {
                println!("  Last seen: {}", format_timestamp(last_seen));
            }
        }

        ContactAction::Remove { contact: query } => {
            let contact = find_contact(&contacts, &query)?;
            contacts.remove(&contact.peer_id)?;
            println!(
                "{} Removed contact: {}",
                "✓".green(),
                contact.display_name.bright_cyan()
            );
        }

        ContactAction::Search { query } => {
            let results = contacts.search(&query)?;

            if results.is_empty() {
                println!("{}", "No matching contacts.".dimmed());
            } else {
                println!("{} ({} matches)", "Search Results".bold(), results.len());
                println!();

                for contact in results {
                    println!(
                        "  {} {}",
                        "•".bright_green(),
                        contact.display_name.bright_cyan()
                    );
                    println!("    {}", contact.peer_id.dimmed());
                }
            }
        }
    }

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_history(peer: Option<String>, search: Option<String>, limit: usize) -> Result<()> {
    let config = config::Config::load()?;
    let data_dir = config.data_dir()?;
    let history = history::SledMessageStore::open(data_dir.join("history"))?;
    let contacts = open_contacts(&config)?;

    let peer_id = match &peer {
        Some(query) => Some(
            contacts
                .find(query)?
                .map(|c| c.peer_id)
                .unwrap_or_else(|| query.clone()),
        ),
        None => None,
    };

    let messages = match &search {
        Some(query) => history.search(query, limit)?,
        None => history.recent(peer_id.as_deref(), limit)?,
    };

    if messages.is_empty() {
        println!("{}", "No messages.".dimmed());
        return Ok(());
    }

    // Oldest first
    for message in messages.iter().rev() {
        print_message(&contacts, message);
    }
    Ok(())
}

fn print_message(contacts: &contacts::SledContactStore, message: &ChatMessage) {
    let name = contacts
        .get_by_peer_id(&message.contact_ref)
        .ok()
        .flatten()
        .map(|c| c.display_name)
        .unwrap_or_else(|| message.contact_ref.clone());
    let arrow = match message.direction {
        MessageDirection::Outgoing => "→".bright_green(),
        MessageDirection::Incoming => "←".bright_blue(),
    };
    let content = match message.kind {
        MessageKind::Text => message.content.clone(),
        MessageKind::File => format!("[file] {}", message.content),
    };
    println!(
        "{} {} {} {} ({:?})",
        format_timestamp(message.timestamp).dimmed(),
        arrow,
        name.bright_cyan(),
        content,
        message.delivery_status
    );
}

async fn cmd_relay(host: String, port: Option<u16>) -> Result<()> {
    let config = config::Config::load()?;
    let port = port.unwrap_or(config.relay_port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .context("Invalid relay listen address")?;

    println!("{}", "PeerLink relay".bold());
    println!("  {} WebSocket: ws://{}/ws", "✓".green(), addr);
    println!("  {} Health:    http://{}/health", "✓".green(), addr);

    tokio::select! {
        _ = server::run(addr) => {}
        _ = tokio::signal::ctrl_c() => println!("Shutting down relay..."),
    }
    Ok(())
}

/// Unix milliseconds as `YYYY-MM-DD HH:MM:SS` UTC
fn format_timestamp(timestamp_ms: u64) -> String {
    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(951_782_400_000), "2000-02-29 00:00:00");
        assert_eq!(format_timestamp(1_700_000_000_123), "2023-11-14 22:13:20");
    }

    #[test]
    fn test_cli_parses_relay_and_init() {
        let cli = Cli::try_parse_from(["peerlink", "relay", "--port", "9100"]).unwrap();
        assert!(matches!(cli.command, Commands::Relay { port: Some(9100), .. }));

        let cli = Cli::try_parse_from(["peerlink", "init", "--name", "Alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { force: false, .. }));

        assert!(Cli::try_parse_from(["peerlink", "init"]).is_err());
    }
}
