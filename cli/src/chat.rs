// Interactive chat session
//
// Wires the signaling client, the relay tunnel backend and the peer
// manager together, then runs a line-based REPL on stdin.

use crate::config::Config;
use crate::contacts::SledContactStore;
use crate::history::SledMessageStore;
use anyhow::{Context, Result};
use colored::*;
use peerlink_core::{
    Collaborators, ContactStore, Notifier, OutgoingFile, PeerEvent, PeerManager, ReceivedFile,
    RelayTunnel, SignalingClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

/// Prints notifications inline in the terminal
struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, title: &str, body: &str) {
        println!("\n{} {}: {}", "★".bright_yellow(), title.bold(), body);
    }
}

/// A parsed REPL line
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Connect(&'a str),
    Send { contact: &'a str, text: &'a str },
    File { contact: &'a str, path: &'a str },
    Contacts,
    Peers,
    Status(&'a str),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    let line = line.trim();
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head {
        "/connect" if !rest.is_empty() => Some(Command::Connect(rest)),
        "/send" | "/file" => {
            let (contact, arg) = rest.split_once(' ')?;
            let arg = arg.trim();
            if arg.is_empty() {
                return None;
            }
            if head == "/send" {
                Some(Command::Send { contact, text: arg })
            } else {
                Some(Command::File { contact, path: arg })
            }
        }
        "/contacts" => Some(Command::Contacts),
        "/peers" => Some(Command::Peers),
        "/status" if !rest.is_empty() => Some(Command::Status(rest)),
        "/help" => Some(Command::Help),
        "/quit" | "/exit" => Some(Command::Quit),
        _ => None,
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    match ext.as_deref() {
        Some("txt") | Some("md") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Write a received file under `dir`, keeping only the final path component
fn save_received(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    let name = Path::new(&file.name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| file.file_id.clone());
    std::fs::create_dir_all(dir).context("Failed to create downloads directory")?;
    let path = dir.join(name);
    std::fs::write(&path, &file.bytes).context("Failed to write received file")?;
    Ok(path)
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

pub async fn run(config: &Config) -> Result<()> {
    let identity = config.require_identity()?;
    let data_dir = config.data_dir()?;
    let downloads = data_dir.join("downloads");

    let contacts = Arc::new(SledContactStore::open(data_dir.join("contacts"))?);
    let history = Arc::new(SledMessageStore::open(data_dir.join("history"))?);

    let (client, signaling_events) =
        SignalingClient::spawn(config.signaling_config(), identity.clone());
    let backend = Arc::new(RelayTunnel::new(Arc::new(client.clone())));

    let manager = PeerManager::new(
        config.manager_config(),
        Collaborators {
            identity: Arc::new(identity.clone()),
            contacts: contacts.clone(),
            messages: history.clone(),
            notifier: Arc::new(TerminalNotifier),
        },
        backend,
    );
    let mut events = manager.subscribe_events();
    manager.attach_signaling(client, signaling_events);
    manager
        .register_peer()
        .await
        .context("Failed to start transport")?;

    println!("{}", "PeerLink chat".bold());
    println!(
        "  You are {} ({})",
        identity.display_name.bright_cyan(),
        identity.id.dimmed()
    );
    println!("  Relay:  {}", config.relay_url);
    println!("  Type {} for commands", "/help".bright_green());
    println!();

    let event_contacts = contacts.clone();
    let event_task = tokio::spawn(async move {
        let name_of = |peer_id: &str| {
            event_contacts
                .get_by_peer_id(peer_id)
                .ok()
                .flatten()
                .map(|c| c.display_name)
                .unwrap_or_else(|| peer_id.to_string())
        };

        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::ChatReceived(message) => {
                    println!(
                        "\n{} {}: {}",
                        "←".bright_blue(),
                        name_of(&message.contact_ref).bright_cyan(),
                        message.content
                    );
                }
                PeerEvent::FileReceived(file) => match save_received(&downloads, &file) {
                    Ok(path) => println!(
                        "\n{} {} sent {} ({} bytes) -> {}",
                        "←".bright_blue(),
                        name_of(&file.peer_id).bright_cyan(),
                        file.name,
                        file.bytes.len(),
                        path.display()
                    ),
                    Err(e) => println!("\n{} Could not save {}: {}", "✗".red(), file.name, e),
                },
                PeerEvent::StateChanged { peer_id, state } => {
                    println!("\n{} {} is {}", "•".dimmed(), name_of(&peer_id), state);
                }
                PeerEvent::PeerStatus { peer_id, presence } => {
                    println!(
                        "\n{} {} is now {}",
                        "•".dimmed(),
                        name_of(&peer_id),
                        presence.as_str()
                    );
                }
                PeerEvent::TransferExpired(expired) => {
                    println!("\n{} {}", "✗".red(), expired);
                }
                PeerEvent::CallSignal { peer_id, payload } => {
                    println!(
                        "\n{} {} from {} (calls are not supported here)",
                        "☎".yellow(),
                        payload.message_type(),
                        name_of(&peer_id)
                    );
                }
                PeerEvent::SignalingLost => {
                    println!(
                        "\n{} Lost the relay connection for good. Restart to retry.",
                        "✗".red()
                    );
                }
                PeerEvent::ContactAdded(_)
                | PeerEvent::Typing { .. }
                | PeerEvent::ReadReceipt { .. }
                | PeerEvent::RelaySignal(_) => continue,
            }
            prompt();
        }
    });

    let resolve = |query: &str| -> String {
        contacts
            .find(query)
            .ok()
            .flatten()
            .map(|c| c.peer_id)
            .unwrap_or_else(|| query.to_string())
    };

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    prompt();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            prompt();
            continue;
        }

        match parse_command(&line) {
            Some(Command::Quit) => break,
            Some(Command::Connect(query)) => {
                let peer_id = resolve(query);
                match manager.connect_to_peer(&peer_id).await {
                    Ok(()) => println!("{} Connected to {}", "✓".green(), peer_id),
                    Err(e) => println!("{} {}", "✗".red(), e),
                }
            }
            Some(Command::Send { contact, text }) => {
                let peer_id = resolve(contact);
                if manager.ensure_connection(&peer_id).await && manager.send_message(&peer_id, text)
                {
                    println!("{} Sent", "✓".green());
                } else {
                    println!("{} Not delivered to {}", "✗".red(), peer_id);
                }
            }
            Some(Command::File { contact, path }) => {
                let peer_id = resolve(contact);
                let path = Path::new(path);
                match std::fs::read(path) {
                    Ok(bytes) => {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "file".to_string());
                        let file = OutgoingFile::new(name, guess_mime_type(path), bytes);
                        if manager.ensure_connection(&peer_id).await
                            && manager.send_file(&peer_id, &file)
                        {
                            println!("{} Sent {}", "✓".green(), file.name);
                        } else {
                            println!("{} Transfer to {} failed", "✗".red(), peer_id);
                        }
                    }
                    Err(e) => println!("{} Cannot read {}: {}", "✗".red(), path.display(), e),
                }
            }
            Some(Command::Contacts) => match contacts.get_all() {
                Ok(list) if list.is_empty() => println!("No contacts."),
                Ok(list) => {
                    for c in list {
                        println!(
                            "  • {} {} [{}]",
                            c.display_name.bright_cyan(),
                            c.peer_id.dimmed(),
                            c.presence.as_str()
                        );
                    }
                }
                Err(e) => println!("{} {}", "✗".red(), e),
            },
            Some(Command::Peers) => {
                let peers = manager.connected_peers();
                if peers.is_empty() {
                    println!("No open channels.");
                }
                for peer_id in peers {
                    println!("  • {}", peer_id);
                }
            }
            Some(Command::Status(status)) => {
                if manager.publish_status(status) {
                    println!("{} Status set to {}", "✓".green(), status);
                } else {
                    println!("{} Relay not connected", "✗".red());
                }
            }
            Some(Command::Help) | None => {
                println!("Commands:");
                println!("  {} <contact>", "/connect".bright_green());
                println!("  {} <contact> <message>", "/send".bright_green());
                println!("  {} <contact> <path>", "/file".bright_green());
                println!("  {}", "/contacts".bright_green());
                println!("  {}", "/peers".bright_green());
                println!("  {} <online|away|...>", "/status".bright_green());
                println!("  {}", "/quit".bright_green());
            }
        }
        prompt();
    }

    println!("Shutting down...");
    manager.shutdown().await;
    event_task.abort();
    Ok(())
}
