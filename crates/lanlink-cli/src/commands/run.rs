//! Run command implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use lanlink_core::discovery::Peer;
use lanlink_core::message::{InMemoryStore, MessageStore};
use lanlink_core::node::{Node, NodeEvent};
use lanlink_core::transfer::Transfer;

use super::RunArgs;
use crate::ui;

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Peers,
    Msg { peer: String, text: String },
    Image { peer: String, path: PathBuf },
    File { peer: String, path: PathBuf },
    Send { file_id: String },
    Accept { file_id: String, path: PathBuf },
    Reject { file_id: String },
    Cancel { file_id: String },
    Transfers,
    History { peer: String },
    Help,
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let one = |usage: &str| -> Result<String> {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                bail!("usage: {usage}");
            }
            Ok(rest.to_string())
        };
        let two = |usage: &str| -> Result<(String, String)> {
            match rest.split_once(char::is_whitespace) {
                Some((first, second)) if !second.trim().is_empty() => {
                    Ok((first.to_string(), second.trim().to_string()))
                }
                _ => bail!("usage: {usage}"),
            }
        };

        let input = match command {
            "/peers" => Self::Peers,
            "/msg" => {
                let (peer, text) = two("/msg <peer> <text>")?;
                Self::Msg { peer, text }
            }
            "/image" => {
                let (peer, path) = two("/image <peer> <path>")?;
                Self::Image {
                    peer,
                    path: path.into(),
                }
            }
            "/file" => {
                let (peer, path) = two("/file <peer> <path>")?;
                Self::File {
                    peer,
                    path: path.into(),
                }
            }
            "/send" => Self::Send {
                file_id: one("/send <file_id>")?,
            },
            "/accept" => {
                let (file_id, path) = two("/accept <file_id> <path>")?;
                Self::Accept {
                    file_id,
                    path: path.into(),
                }
            }
            "/reject" => Self::Reject {
                file_id: one("/reject <file_id>")?,
            },
            "/cancel" => Self::Cancel {
                file_id: one("/cancel <file_id>")?,
            },
            "/transfers" => Self::Transfers,
            "/history" => Self::History {
                peer: one("/history <peer>")?,
            },
            "/help" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            other => bail!("unknown command {other}, try /help"),
        };
        Ok(input)
    }
}

/// Find a peer by exact id, display name, or unique id prefix.
fn resolve_peer<'a>(peers: &'a [Peer], query: &str) -> Result<&'a Peer> {
    if let Some(peer) = peers.iter().find(|p| p.id == query) {
        return Ok(peer);
    }

    let named: Vec<&Peer> = peers
        .iter()
        .filter(|p| p.name.eq_ignore_ascii_case(query))
        .collect();
    if let [peer] = named.as_slice() {
        return Ok(peer);
    }

    let prefixed: Vec<&Peer> = peers.iter().filter(|p| p.id.starts_with(query)).collect();
    match prefixed.as_slice() {
        [peer] => Ok(peer),
        [] if named.is_empty() => Err(anyhow!("no peer matches {query}")),
        _ => Err(anyhow!("{query} matches more than one peer, use a longer id")),
    }
}

/// Find a transfer by exact id or unique prefix.
fn resolve_transfer(transfers: &[Transfer], query: &str) -> Result<String> {
    let matches: Vec<&Transfer> = transfers
        .iter()
        .filter(|t| t.file_id.starts_with(query))
        .collect();
    match matches.as_slice() {
        [transfer] => Ok(transfer.file_id.clone()),
        [] => Err(anyhow!("no transfer matches {query}")),
        _ => Err(anyhow!("{query} matches more than one transfer")),
    }
}

/// Run the run command.
pub async fn run(args: RunArgs) -> Result<()> {
    let (mut config, path) = super::load_config(args.config.as_deref())?;
    config
        .apply_env()
        .context("Invalid LANLINK_* environment override")?;
    if let Some(name) = args.name {
        config.identity.display_name = name;
    }
    if let Some(port) = args.discovery_port {
        config.discovery.port = port;
    }
    if let Some(port) = args.transport_port {
        config.transport.port = port;
    }
    tracing::debug!(config = %path.display(), "Configuration loaded");

    let store = Arc::new(InMemoryStore::new());
    let node = Node::start_with_store(&config, Some(store.clone() as Arc<dyn MessageStore>))
        .await
        .context("Failed to start node")?;

    ui::print_banner(
        node.local_identity(),
        node.transport_addr(),
        node.discovery_addr(),
    );

    let printer = tokio::spawn(print_events(node.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match Input::parse(&line) {
                    Ok(Input::Quit) => break,
                    Ok(input) => {
                        if let Err(e) = execute(&node, &store, input).await {
                            eprintln!("  error: {e:#}");
                        }
                    }
                    Err(e) => eprintln!("  {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("  Leaving the network...");
    node.stop().await;
    printer.abort();
    Ok(())
}

async fn execute(node: &Node, store: &InMemoryStore, input: Input) -> Result<()> {
    match input {
        Input::Peers => ui::print_peers(&node.peers().await),
        Input::Msg { peer, text } => {
            let peer = resolve_peer(&node.peers().await, &peer)?.id.clone();
            let message = node.send_text(&peer, &text).await?;
            ui::print_message(&message);
        }
        Input::Image { peer, path } => {
            let peer = resolve_peer(&node.peers().await, &peer)?.id.clone();
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let message = node.send_image(&peer, bytes).await?;
            ui::print_message(&message);
        }
        Input::File { peer, path } => {
            let peer = resolve_peer(&node.peers().await, &peer)?.id.clone();
            let transfer = node.send_file(&peer, &path).await?;
            println!(
                "  Offered {} ({}) as {}, waiting for an answer",
                transfer.file_name,
                ui::format_size(transfer.file_size),
                ui::short_id(&transfer.file_id)
            );
        }
        Input::Send { file_id } => {
            let file_id = resolve_transfer(&node.active_transfers().await, &file_id)?;
            let transfer = node.start_sending(&file_id).await?;
            println!("  Sending {}", transfer.file_name);
        }
        Input::Accept { file_id, path } => {
            let file_id = resolve_transfer(&node.active_transfers().await, &file_id)?;
            let transfer = node.accept_transfer(&file_id, &path).await?;
            println!(
                "  Accepted {}, saving to {}",
                transfer.file_name,
                path.display()
            );
        }
        Input::Reject { file_id } => {
            let file_id = resolve_transfer(&node.active_transfers().await, &file_id)?;
            let transfer = node.reject_transfer(&file_id).await?;
            println!("  Rejected {}", transfer.file_name);
        }
        Input::Cancel { file_id } => {
            let file_id = resolve_transfer(&node.active_transfers().await, &file_id)?;
            let transfer = node.cancel_transfer(&file_id).await?;
            println!("  Cancelled {}", transfer.file_name);
        }
        Input::Transfers => ui::print_transfers(&node.active_transfers().await),
        Input::History { peer } => {
            let peer = resolve_peer(&node.peers().await, &peer)?.id.clone();
            for message in store.conversation(&peer) {
                ui::print_message(&message);
            }
        }
        Input::Help => ui::print_help(),
        Input::Quit | Input::Empty => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<NodeEvent>) {
    let mut shown: HashMap<String, u8> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Skipped {n} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            NodeEvent::PeerDiscovered(peer) => println!(
                "  + {} ({}) joined from {}",
                peer.name,
                ui::short_id(&peer.id),
                peer.address
            ),
            NodeEvent::PeerLeft(peer) => println!("  - {} left", peer.name),
            NodeEvent::MessageReceived(message) => ui::print_message(&message),
            NodeEvent::Typing { peer_id } => {
                tracing::debug!(peer_id = %peer_id, "Peer is typing");
            }
            NodeEvent::TransferRequested(t) => println!(
                "  {} offers {} ({}): /accept {} <path> or /reject {}",
                t.sender_name,
                t.file_name,
                ui::format_size(t.file_size),
                ui::short_id(&t.file_id),
                ui::short_id(&t.file_id)
            ),
            NodeEvent::TransferAccepted(t) => println!(
                "  {} was accepted: /send {} to start",
                t.file_name,
                ui::short_id(&t.file_id)
            ),
            NodeEvent::TransferRejected(t) => println!("  {} was declined", t.file_name),
            NodeEvent::TransferProgress {
                file_id, percent, ..
            } => {
                let last = shown.entry(file_id.clone()).or_insert(0);
                if percent >= last.saturating_add(10) || (percent == 100 && *last != 100) {
                    *last = percent;
                    println!("  {}: {percent}%", ui::short_id(&file_id));
                }
            }
            NodeEvent::TransferCompleted(t) => {
                shown.remove(&t.file_id);
                match &t.save_path {
                    Some(path) => println!("  Received {} into {}", t.file_name, path.display()),
                    None => println!("  Sent {}", t.file_name),
                }
            }
            NodeEvent::TransferFailed { transfer, reason } => {
                shown.remove(&transfer.file_id);
                println!("  {} {}: {reason}", transfer.file_name, transfer.state);
            }
            NodeEvent::Error(message) => eprintln!("  error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn peer(id: &str, name: &str) -> Peer {
        Peer::new(
            id,
            name,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            9999,
            Instant::now(),
        )
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Input::parse("  ").unwrap(), Input::Empty);
        assert_eq!(Input::parse("/peers").unwrap(), Input::Peers);
        assert_eq!(
            Input::parse("/msg bob hello there").unwrap(),
            Input::Msg {
                peer: "bob".to_string(),
                text: "hello there".to_string()
            }
        );
        assert_eq!(
            Input::parse("/accept 1a2b ./downloads/report.pdf").unwrap(),
            Input::Accept {
                file_id: "1a2b".to_string(),
                path: PathBuf::from("./downloads/report.pdf")
            }
        );
        assert_eq!(Input::parse("/quit").unwrap(), Input::Quit);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Input::parse("/msg bob").is_err());
        assert!(Input::parse("/send").is_err());
        assert!(Input::parse("/send a b").is_err());
        assert!(Input::parse("hello").is_err());
    }

    #[test]
    fn test_resolve_peer() {
        let peers = vec![
            peer("a1b2c3", "Alice"),
            peer("a1ffff", "Alan"),
            peer("b0b0b0", "Bob"),
        ];

        assert_eq!(resolve_peer(&peers, "b0b0b0").unwrap().name, "Bob");
        assert_eq!(resolve_peer(&peers, "alice").unwrap().id, "a1b2c3");
        assert_eq!(resolve_peer(&peers, "a1b").unwrap().name, "Alice");
        assert!(resolve_peer(&peers, "a1").is_err());
        assert!(resolve_peer(&peers, "zed").is_err());
    }
}
