// Interactive console: parses operator lines into commands
//
//   broadcast [#tag ...] <type> <payload>
//   send <peer> [#tag ...] <type> <payload>
//
// A payload that parses as JSON is sent as-is, anything else as a JSON string.

use crate::config::parse_list;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Broadcast {
        recipient: Option<String>,
        message_type: String,
        data: Value,
        tags: Vec<String>,
    },
    Peers,
    /// Announce base tags plus these extras
    Tags(Vec<String>),
    /// Show (None) or replace the base tags
    BaseTags(Option<Vec<String>>),
    /// Show (None) or replace the blocked tags
    BlockedTags(Option<Vec<String>>),
    Block(String),
    Unblock(String),
    Blocked,
    /// Messages from the last N minutes
    Messages(u64),
    /// Delete messages older than N minutes
    Purge(u64),
    Status,
    Help,
    Quit,
}

pub const HELP: &[(&str, &str)] = &[
    ("broadcast [#tag ...] <type> <payload>", "sign and gossip to everyone"),
    ("send <peer> [#tag ...] <type> <payload>", "address a message to one peer"),
    ("peers", "list known peers"),
    ("tags <a,b>", "announce base tags plus extras"),
    ("base-tags [a,b]", "show or replace base tags"),
    ("blocked-tags [a,b|clear]", "show or replace blocked tags"),
    ("block <peer> / unblock <peer>", "local peer policy"),
    ("blocked", "list blocked peers"),
    ("messages [minutes]", "stored messages, default last 60 minutes"),
    ("purge <minutes>", "delete messages older than this"),
    ("status", "node summary"),
    ("quit", "stop the node"),
];

pub fn parse(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head {
        "broadcast" => parse_draft(None, rest),
        "send" => {
            let (peer, rest) = rest
                .split_once(char::is_whitespace)
                .ok_or("Usage: send <peer> [#tag ...] <type> <payload>")?;
            parse_draft(Some(peer.to_string()), rest.trim())
        }
        "peers" => Ok(ConsoleCommand::Peers),
        "tags" => {
            let tags = parse_list(rest);
            if tags.is_empty() {
                return Err("Usage: tags <a,b>".into());
            }
            Ok(ConsoleCommand::Tags(tags))
        }
        "base-tags" => Ok(ConsoleCommand::BaseTags(optional_list(rest))),
        "blocked-tags" => Ok(ConsoleCommand::BlockedTags(if rest == "clear" {
            Some(Vec::new())
        } else {
            optional_list(rest)
        })),
        "block" | "unblock" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                return Err(format!("Usage: {} <peer>", head));
            }
            Ok(if head == "block" {
                ConsoleCommand::Block(rest.to_string())
            } else {
                ConsoleCommand::Unblock(rest.to_string())
            })
        }
        "blocked" => Ok(ConsoleCommand::Blocked),
        "messages" => {
            if rest.is_empty() {
                return Ok(ConsoleCommand::Messages(60));
            }
            rest.parse()
                .map(ConsoleCommand::Messages)
                .map_err(|_| "Usage: messages [minutes]".to_string())
        }
        "purge" => rest
            .parse()
            .map(ConsoleCommand::Purge)
            .map_err(|_| "Usage: purge <minutes>".to_string()),
        "status" => Ok(ConsoleCommand::Status),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(format!("Unknown command: {} (try help)", other)),
    }
}

/// Unix ms `minutes` before `now`, clamped at zero for huge windows.
pub fn minutes_before(now: u64, minutes: u64) -> u64 {
    now.saturating_sub(minutes.saturating_mul(60_000))
}

fn optional_list(rest: &str) -> Option<Vec<String>> {
    if rest.is_empty() {
        None
    } else {
        Some(parse_list(rest))
    }
}

fn parse_draft(recipient: Option<String>, rest: &str) -> Result<ConsoleCommand, String> {
    let mut rest = rest;
    let mut tags = Vec::new();
    while let Some(tagged) = rest.strip_prefix('#') {
        let (tag, tail) = tagged.split_once(char::is_whitespace).unwrap_or((tagged, ""));
        if !tag.is_empty() {
            tags.push(tag.to_string());
        }
        rest = tail.trim_start();
    }

    let (message_type, payload) = match rest.split_once(char::is_whitespace) {
        Some((t, p)) => (t, p.trim()),
        None => (rest, ""),
    };
    if message_type.is_empty() {
        return Err("Missing message type".into());
    }

    let data = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
    };

    Ok(ConsoleCommand::Broadcast {
        recipient,
        message_type: message_type.to_string(),
        data,
        tags,
    })
}
