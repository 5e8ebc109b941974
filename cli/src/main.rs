// relaynet: operator CLI for a gossip relay node
//
// `start` runs a node with an interactive console; the other commands work
// offline against the node's storage.

mod config;
mod console;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use console::ConsoleCommand;
use relaynet_core::identity::IdentityStore;
use relaynet_core::message::now_millis;
use relaynet_core::store::StorageBackend;
use relaynet_core::{
    provision_identity, KvRelayStore, Message, MessageDraft, MessageQuery, PeerInfo,
    RelayEngine, RelayEvent, RelayNode, RelayStore, SledStorage,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaynet")]
#[command(about = "relaynet, a signed gossip relay node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay node with an interactive console
    Start {
        #[arg(short, long)]
        port: Option<u16>,
        /// Local WebSocket bridge port (0 disables)
        #[arg(short, long)]
        bridge_port: Option<u16>,
    },
    /// Show identity information
    Identity {
        /// Print the private key as well
        #[arg(long)]
        export: bool,
    },
    /// List stored messages
    Messages {
        /// Only the last N minutes
        #[arg(short, long, default_value = "60")]
        minutes: u64,
        /// Keep messages carrying any of these tags (comma-separated)
        #[arg(short, long)]
        tags: Option<String>,
        /// Include messages with blocked tags
        #[arg(long)]
        all: bool,
    },
    /// Delete stored messages older than N minutes
    Purge {
        #[arg(long)]
        older_than_minutes: u64,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Bootstrap {
        #[command(subcommand)]
        action: BootstrapAction,
    },
}

#[derive(Subcommand)]
enum BootstrapAction {
    Add { multiaddr: String },
    Remove { multiaddr: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config)?;

    match cli.command {
        Commands::Start { port, bridge_port } => cmd_start(config, port, bridge_port).await,
        Commands::Identity { export } => cmd_identity(config, export),
        Commands::Messages { minutes, tags, all } => cmd_messages(config, minutes, tags, all).await,
        Commands::Purge { older_than_minutes } => cmd_purge(config, older_than_minutes).await,
        Commands::Config { action } => cmd_config(action),
    }
}

/// stderr always; a daily-rolling file as well when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_logging(
    config: &config::Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "relaynet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry().with(stderr).with(file).init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(stderr).init();
            Ok(None)
        }
    }
}

fn open_backend(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.storage_dir()?;
    std::fs::create_dir_all(&path).context("Failed to create storage directory")?;
    let backend = SledStorage::open(&path)
        .with_context(|| format!("Failed to open storage at {}", path.display()))?;
    Ok(Arc::new(backend))
}

fn cmd_identity(config: config::Config, export: bool) -> Result<()> {
    let backend = open_backend(&config)?;
    let keys = match IdentityStore::new(backend.clone())
        .load_keys()
        .context("Failed to read identity")?
    {
        Some(keys) => keys,
        None => {
            println!("{}", "No identity yet, generating one.".dimmed());
            provision_identity(&config.to_node_config(), backend)
                .context("Failed to create identity")?
        }
    };

    println!("{}", "Identity".bold());
    println!("  Peer ID:    {}", keys.peer_id()?.bright_cyan());
    println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
    if export {
        println!();
        println!("{}", "Keep this secret:".red().bold());
        println!("  RELAY_PRIVATE_KEY={}", keys.secret_hex().as_str());
    }
    Ok(())
}

async fn cmd_messages(
    config: config::Config,
    minutes: u64,
    tags: Option<String>,
    all: bool,
) -> Result<()> {
    let store = KvRelayStore::new(open_backend(&config)?);
    let end = now_millis();
    let mut query = MessageQuery::between(console::minutes_before(end, minutes), end);
    if let Some(tags) = tags {
        query = query.including(config::parse_list(&tags));
    }
    if !all {
        query = query.excluding(store.load_blocked_tags().await?);
    }

    let messages = store.get_messages(&query).await?;
    print_messages(&messages);
    Ok(())
}

async fn cmd_purge(config: config::Config, older_than_minutes: u64) -> Result<()> {
    let store = KvRelayStore::new(open_backend(&config)?);
    let cutoff = console::minutes_before(now_millis(), older_than_minutes);
    let deleted = store.delete_messages_before(cutoff).await?;
    info!("Purged {} messages older than {} minutes", deleted, older_than_minutes);
    println!("{} Deleted {} messages", "✓".green(), deleted);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load_file()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown or unset config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!("  {}", config::Config::config_file()?.display().to_string().dimmed());
            for (key, value) in config.list() {
                println!("  {:<18} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Bootstrap { action } => match action {
            BootstrapAction::Add { multiaddr } => {
                config.add_bootstrap_node(multiaddr.clone())?;
                println!("{} Added bootstrap node {}", "✓".green(), multiaddr);
            }
            BootstrapAction::Remove { multiaddr } => {
                config.remove_bootstrap_node(&multiaddr)?;
                println!("{} Removed bootstrap node {}", "✓".green(), multiaddr);
            }
            BootstrapAction::List => {
                if config.bootstrap_nodes.is_empty() {
                    println!("{}", "No bootstrap nodes.".dimmed());
                }
                for node in &config.bootstrap_nodes {
                    println!("  {} {}", "•".bright_green(), node);
                }
            }
        },
    }
    Ok(())
}

async fn cmd_start(
    mut config: config::Config,
    port: Option<u16>,
    bridge_port: Option<u16>,
) -> Result<()> {
    if let Some(port) = port {
        config.listen_port = port;
    }
    if let Some(port) = bridge_port {
        config.bridge_port = port;
    }

    println!("{}", "relaynet starting...".bold());
    let backend = open_backend(&config)?;
    let node = RelayNode::start(config.to_node_config(), backend)
        .await
        .context("Failed to start relay node")?;
    let engine = node.engine().clone();

    println!("{} Peer ID: {}", "✓".green(), node.peer_id().bright_cyan());
    println!("{} Gossip on port {}", "✓".green(), config.listen_port);
    if let Some(addr) = node.bridge_addr() {
        println!("{} Local bridge on ws://{}", "✓".green(), addr);
    }
    println!();
    print_help();

    let event_task = tokio::spawn(print_events(engine.subscribe()));

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    prompt();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                if line.trim().is_empty() {
                    prompt();
                    continue;
                }
                match console::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        if let Err(e) = run_command(&engine, command).await {
                            println!("{} {:#}", "✗".red(), e);
                        }
                    }
                    Err(usage) => println!("{}", usage.yellow()),
                }
                prompt();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down...");
    event_task.abort();
    node.stop().await;
    Ok(())
}

async fn run_command(engine: &RelayEngine, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Broadcast {
            recipient,
            message_type,
            data,
            tags,
        } => {
            let mut draft = MessageDraft::new(message_type, data);
            if let Some(recipient) = recipient {
                draft = draft.to(recipient);
            }
            if !tags.is_empty() {
                draft = draft.with_tags(tags);
            }
            let id = engine.broadcast(draft).await?;
            println!("{} Sent {}", "✓".green(), id.dimmed());
        }
        ConsoleCommand::Peers => {
            let peers = engine.get_peers().await;
            if peers.is_empty() {
                println!("{}", "No peers.".dimmed());
            }
            for peer in &peers {
                print_peer(peer);
            }
        }
        ConsoleCommand::Tags(extra) => {
            engine.update_tags(extra).await?;
            println!("{} Tags announced", "✓".green());
        }
        ConsoleCommand::BaseTags(None) => print_list("Base tags", &engine.get_base_tags()),
        ConsoleCommand::BaseTags(Some(tags)) => {
            engine.update_base_tags(tags).await?;
            print_list("Base tags", &engine.get_base_tags());
        }
        ConsoleCommand::BlockedTags(None) => print_list("Blocked tags", &engine.get_blocked_tags()),
        ConsoleCommand::BlockedTags(Some(tags)) => {
            let tags = engine.update_blocked_tags(tags).await?;
            print_list("Blocked tags", &tags);
        }
        ConsoleCommand::Block(peer) => {
            engine.block_peer(&peer, true).await?;
            println!("{} Blocked {}", "✓".green(), peer);
        }
        ConsoleCommand::Unblock(peer) => {
            engine.block_peer(&peer, false).await?;
            println!("{} Unblocked {}", "✓".green(), peer);
        }
        ConsoleCommand::Blocked => print_list("Blocked peers", &engine.get_blocked_peers()),
        ConsoleCommand::Messages(minutes) => {
            let end = now_millis();
            let messages = engine
                .query_messages(console::minutes_before(end, minutes), end, None, None)
                .await?;
            print_messages(&messages);
        }
        ConsoleCommand::Purge(minutes) => {
            let deleted = engine
                .delete_messages_before(console::minutes_before(now_millis(), minutes))
                .await?;
            println!("{} Deleted {} messages", "✓".green(), deleted);
        }
        ConsoleCommand::Status => {
            let peers = engine.get_peers().await;
            println!("Peer ID:   {}", engine.local_peer_id().bright_cyan());
            println!("Peers:     {}", peers.len());
            println!("Base tags: {}", engine.get_base_tags().join(", "));
            println!(
                "Blocked:   {} peers, {} tags",
                engine.get_blocked_peers().len(),
                engine.get_blocked_tags().len()
            );
            println!("Seen ids:  {}", engine.dedup().len());
            println!("Bootstrap: {}", engine.get_bootstrap_nodes().len());
        }
        ConsoleCommand::Help => print_help(),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::MessageReceived(message)) => {
                println!(
                    "\n{} {} [{}] {}",
                    "←".bright_blue(),
                    short(&message.sender).bright_cyan(),
                    message.message_type.bold(),
                    message.data
                );
                prompt();
            }
            Ok(RelayEvent::PeerDiscovered(peer)) => {
                println!("\n{} Peer: {}", "✓".green(), peer.id);
                prompt();
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Console fell behind, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("{}", "Commands:".bold());
    for (usage, about) in console::HELP {
        println!("  {:<42} {}", usage.bright_green(), about.dimmed());
    }
    println!();
}

fn print_peer(peer: &PeerInfo) {
    let marker = if peer.blocked { "✗".red() } else { "•".bright_green() };
    println!("  {} {}", marker, peer.id.bright_cyan());
    if !peer.tags.is_empty() {
        println!("    Tags: {}", peer.tags.join(", "));
    }
    if !peer.addresses.is_empty() {
        println!("    Addrs: {}", peer.addresses.join(", ").dimmed());
    }
    if peer.last_seen > 0 {
        println!("    Seen: {}", format_timestamp(peer.last_seen).dimmed());
    }
    if peer.public_key.is_empty() {
        println!("    {}", "no key announced".yellow());
    }
}

fn print_list(title: &str, values: &[String]) {
    if values.is_empty() {
        println!("{}: {}", title.bold(), "(none)".dimmed());
    } else {
        println!("{}: {}", title.bold(), values.join(", "));
    }
}

fn print_messages(messages: &[Message]) {
    if messages.is_empty() {
        println!("{}", "No messages found.".dimmed());
        return;
    }

    println!("{} ({} messages)", "Messages".bold(), messages.len());
    for message in messages {
        let valid = message.validations.iter().filter(|v| v.is_valid).count();
        println!(
            "{} {} [{}] {} {}",
            format_timestamp(message.timestamp).dimmed(),
            short(&message.sender).bright_cyan(),
            message.message_type.bold(),
            message.data,
            format!("({}/{} valid)", valid, message.validations.len()).dimmed()
        );
        if !message.tags.is_empty() {
            println!("   #{}", message.tags.join(" #"));
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Last eight characters of a peer id
fn short(peer_id: &str) -> &str {
    let start = peer_id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &peer_id[start..]
}

fn format_timestamp(timestamp_ms: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(timestamp_ms as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
