//! UI utilities for Lanlink CLI.

use std::net::SocketAddr;

use lanlink_core::config::LocalIdentity;
use lanlink_core::discovery::Peer;
use lanlink_core::message::ChatMessage;
use lanlink_core::transfer::Transfer;

const RULE_WIDTH: usize = 60;

/// Format a byte count for humans.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// First eight characters of an id.
pub fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(i, _)| &id[..i])
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

/// Print the startup banner.
pub fn print_banner(identity: &LocalIdentity, transport: SocketAddr, discovery: SocketAddr) {
    println!();
    println!("  Lanlink {}", lanlink_core::VERSION);
    println!("  Name:       {}", identity.name);
    println!("  Peer id:    {}", identity.id);
    println!("  Transport:  {transport}");
    println!("  Discovery:  {discovery}");
    println!();
    println!("  Type /help for commands.");
    println!();
}

/// Print the command reference.
pub fn print_help() {
    println!("  /peers                       list peers online");
    println!("  /msg <peer> <text>           send a text message");
    println!("  /image <peer> <path>         send an image");
    println!("  /file <peer> <path>          offer a file");
    println!("  /send <file_id>              start sending an accepted file");
    println!("  /accept <file_id> <path>     accept an offered file");
    println!("  /reject <file_id>            decline an offered file");
    println!("  /cancel <file_id>            cancel a transfer");
    println!("  /transfers                   list active transfers");
    println!("  /history <peer>              show the conversation with a peer");
    println!("  /quit                        leave the network and exit");
}

/// Print the peer list as a table.
pub fn print_peers(peers: &[Peer]) {
    println!("{}", "─".repeat(RULE_WIDTH));
    println!("  {:10}  {:20}  {:22}", "Id", "Name", "Address");
    println!("{}", "─".repeat(RULE_WIDTH));

    if peers.is_empty() {
        println!("  (no peers online)");
    }
    for peer in peers {
        println!(
            "  {:10}  {:20}  {:22}",
            short_id(&peer.id),
            truncate(&peer.name, 20),
            peer.transport_addr()
        );
    }

    println!("{}", "─".repeat(RULE_WIDTH));
}

/// Print the transfer list as a table.
pub fn print_transfers(transfers: &[Transfer]) {
    println!("{}", "─".repeat(RULE_WIDTH));
    println!(
        "  {:10}  {:20}  {:10}  {:10}  {:4}",
        "Id", "File", "Size", "State", "%"
    );
    println!("{}", "─".repeat(RULE_WIDTH));

    if transfers.is_empty() {
        println!("  (no active transfers)");
    }
    for transfer in transfers {
        println!(
            "  {:10}  {:20}  {:10}  {:10}  {:>3}%",
            short_id(&transfer.file_id),
            truncate(&transfer.file_name, 20),
            format_size(transfer.file_size),
            transfer.state.to_string(),
            transfer.progress()
        );
    }

    println!("{}", "─".repeat(RULE_WIDTH));
}

/// Print one chat line.
pub fn print_message(message: &ChatMessage) {
    let time = message
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S");
    let who = if message.sent_by_me {
        "you"
    } else {
        message.sender_name.as_str()
    };
    println!("[{time}] {who}: {}", message.preview());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(20 * 1024 * 1024), "20.0 MB");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long file name.txt", 8), "a very …");
    }
}
