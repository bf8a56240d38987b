//! `DuoChat`: line-oriented direct messaging client.
//!
//! Signs in to a relay server, opens a conversation and sends every line
//! typed on stdin to it. Incoming events are printed as they arrive.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/duochat/config.toml`).
//!
//! ```bash
//! cargo run --bin duochat -- --server http://127.0.0.1:5000 --user alice --to bob
//!
//! # Or via environment variables
//! DUOCHAT_SERVER=http://127.0.0.1:5000 DUOCHAT_USER=alice cargo run --bin duochat
//! ```
//!
//! Lines starting with `/` are commands: `/to <user>`, `/users`,
//! `/image <url>`, `/quit`.

use std::io;
use std::path::Path;
use std::time::Duration;

use clap::Parser;
use duochat::config::{CliArgs, ClientConfig};
use duochat::net::{self, NetCommand, NetEvent};
use duochat_proto::message::{ChatMessage, NewMessage, UserId};
use duochat_proto::presence::{PresenceStatus, UserStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

/// How long to wait for the socket to close on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they don't interleave with the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(server = %config.server_url, "duochat starting");

    let Some(net_config) = config.to_net_config() else {
        eprintln!("No user configured: pass --user <id> or set DUOCHAT_USER");
        std::process::exit(2);
    };
    let me = net_config.user.clone();

    let (cmd_tx, mut evt_rx) = match net::spawn_net(net_config).await {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("Could not connect to {}: {e}", config.server_url);
            std::process::exit(1);
        }
    };
    println!("Signed in as {me}. Type /to <user> to open a conversation, /quit to exit.");

    let result = run(&me, &cmd_tx, &mut evt_rx).await;
    let _ = cmd_tx.send(NetCommand::Shutdown).await;

    // The supervisor drops its sender after closing the socket.
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while evt_rx.recv().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("net supervisor did not stop in time");
    }

    tracing::info!("duochat exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("duochat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Open(UserId),
    Users,
    Send(NewMessage),
    Quit,
    Nothing,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Nothing;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(NewMessage::text(line));
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));
    match (name, arg) {
        ("to", user) if !user.is_empty() => Input::Open(UserId::new(user)),
        ("users", _) => Input::Users,
        ("image", url) if !url.is_empty() => Input::Send(NewMessage::image(url)),
        ("quit" | "q", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Pumps stdin lines into commands and prints events until `/quit`, EOF,
/// or the supervisor stops.
async fn run(
    me: &UserId,
    cmd_tx: &mpsc::Sender<NetCommand>,
    evt_rx: &mut mpsc::Receiver<NetEvent>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let cmd = match parse_input(&line) {
                    Input::Open(user) => NetCommand::Select(user),
                    Input::Users => NetCommand::RefreshUsers,
                    Input::Send(body) => NetCommand::Send(body),
                    Input::Quit => break,
                    Input::Nothing => continue,
                    Input::Unknown(text) => {
                        println!("unknown command: {text}");
                        continue;
                    }
                };
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            event = evt_rx.recv() => {
                let Some(event) = event else {
                    println!("disconnected");
                    break;
                };
                println!("{}", render(me, &event));
            }
        }
    }
    Ok(())
}

fn render_message(me: &UserId, msg: &ChatMessage) -> String {
    let who = if &msg.sender_id == me {
        "you"
    } else {
        msg.sender_id.as_str()
    };
    let body = match (&msg.text, &msg.image) {
        (Some(text), Some(image)) => format!("{text} [image: {image}]"),
        (Some(text), None) => text.clone(),
        (None, Some(image)) => format!("[image: {image}]"),
        (None, None) => String::new(),
    };
    let tick = if &msg.sender_id == me && msg.seen {
        " ✓✓"
    } else {
        ""
    };
    format!("<{who}> {body}{tick}")
}

fn render(me: &UserId, event: &NetEvent) -> String {
    match event {
        NetEvent::ConnectionStatus { connected: true } => "* connected".to_string(),
        NetEvent::ConnectionStatus { connected: false } => "* connection lost".to_string(),
        NetEvent::Reconnecting { attempt, delay } => {
            format!("* reconnecting in {}ms (attempt {attempt})", delay.as_millis())
        }
        NetEvent::UsersUpdated {
            users,
            unseen,
            statuses,
        } => {
            let list: Vec<String> = users
                .iter()
                .map(|u| {
                    let presence = statuses
                        .get(&u.id)
                        .map_or(PresenceStatus::Offline, UserStatus::status);
                    match unseen.get(&u.id) {
                        Some(n) => format!("{} ({}, {presence}) [{n} new]", u.id, u.full_name),
                        None => format!("{} ({}, {presence})", u.id, u.full_name),
                    }
                })
                .collect();
            format!("* users: {}", list.join(", "))
        }
        NetEvent::RosterUpdated(roster) => {
            let names: Vec<&str> = roster.iter().map(UserId::as_str).collect();
            format!("* online: {}", names.join(", "))
        }
        NetEvent::ConversationLoaded { partner, messages } => {
            let mut out = format!("* conversation with {partner} ({} messages)", messages.len());
            for msg in messages {
                out.push('\n');
                out.push_str(&render_message(me, msg));
            }
            out
        }
        NetEvent::MessageReceived(msg) | NetEvent::MessageSent(msg) => render_message(me, msg),
        NetEvent::Unseen { from, count } => format!("* {count} unread from {from}"),
        NetEvent::ConversationSeen { by } => format!("* {by} read your messages"),
        NetEvent::MessageSeen(_) => "* message read".to_string(),
        NetEvent::Error(e) => format!("! {e}"),
    }
}
