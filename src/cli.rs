//! Line-oriented command surface over `Network`
//!
//! Plain text goes to everyone; lines starting with `/` are commands.

use crate::net::{NetError, NetEvent, Network, PeerInfo, TransferStatus};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

pub const HELP: &str = "\
Commands:
  <text>                  send to everyone
  /to <name> <text>       private message
  /send <name> <path>     offer a file
  /accept <file_id>       accept an incoming file
  /reject <file_id>       reject an incoming file
  /cancel <file_id>       withdraw an unanswered offer
  /transfers              list transfers
  /list                   list peers
  /name <new name>        change your display name
  /block <name|addr>      drop chat from a peer
  /unblock <name|addr>    undo /block
  /blocked                list blocked addresses
  /history                show recent chat
  /help                   this text
  /quit                   leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    To { name: String, text: String },
    Send { name: String, path: PathBuf },
    Accept(String),
    Reject(String),
    Cancel(String),
    Transfers,
    List,
    Name(String),
    Block(String),
    Unblock(String),
    Blocked,
    History,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("unknown command: /{0} (try /help)")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CliError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args.trim()),
        None => (rest, ""),
    };

    let one = |usage: &'static str| -> Result<String, CliError> {
        if args.is_empty() {
            Err(CliError::Usage(usage))
        } else {
            Ok(args.to_string())
        }
    };
    let two = |usage: &'static str| -> Result<(String, String), CliError> {
        match args.split_once(char::is_whitespace) {
            Some((a, b)) if !b.trim().is_empty() => Ok((a.to_string(), b.trim().to_string())),
            _ => Err(CliError::Usage(usage)),
        }
    };

    let command = match cmd {
        "to" | "msg" => {
            let (name, text) = two("/to <name> <text>")?;
            Command::To { name, text }
        }
        "send" => {
            let (name, path) = two("/send <name> <path>")?;
            Command::Send {
                name,
                path: PathBuf::from(path),
            }
        }
        "accept" => Command::Accept(one("/accept <file_id>")?),
        "reject" => Command::Reject(one("/reject <file_id>")?),
        "cancel" => Command::Cancel(one("/cancel <file_id>")?),
        "transfers" => Command::Transfers,
        "list" | "users" => Command::List,
        "name" => Command::Name(one("/name <new name>")?),
        "block" => Command::Block(one("/block <name|addr>")?),
        "unblock" => Command::Unblock(one("/unblock <name|addr>")?),
        "blocked" => Command::Blocked,
        "history" => Command::History,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CliError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

/// Read stdin until `/quit`, EOF, or the event stream ends
pub async fn run(network: Network, mut events: mpsc::Receiver<NetEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                };
                match parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = execute(&network, command).await {
                            println!("error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", describe_event(&event)),
                None => break,
            },
        }
    }
}

pub async fn execute(network: &Network, command: Command) -> Result<(), NetError> {
    match command {
        Command::Say(text) => network.send_public_message(&text).await?,
        Command::To { name, text } => network.send_private_message(&name, &text).await?,
        Command::Send { name, path } => {
            let file_id = network.request_file_send(&path, &name).await?;
            println!("offered {} to {} as {}", path.display(), name, file_id);
        }
        Command::Accept(file_id) => network.respond_to_file_transfer(&file_id, true).await?,
        Command::Reject(file_id) => network.respond_to_file_transfer(&file_id, false).await?,
        Command::Cancel(file_id) => network.cancel_transfer(&file_id).await?,
        Command::Transfers => {
            for t in network.list_transfers().await {
                println!(
                    "{} {:?} {} {} {}% ({}/{} bytes) with {}",
                    t.file_id,
                    t.direction,
                    t.file_name,
                    t.status,
                    t.progress(),
                    t.bytes_transferred,
                    t.file_size,
                    t.peer_name
                );
            }
        }
        Command::List => {
            let peers = network.list_active_peers().await;
            if peers.is_empty() {
                println!("no peers");
            }
            for p in peers {
                println!("{}", describe_peer(&p));
            }
        }
        Command::Name(name) => network.rename_self(&name).await?,
        Command::Block(target) => {
            let addr = resolve_addr(network, &target).await?;
            network.set_blocked(addr, true).await;
        }
        Command::Unblock(target) => {
            let addr = resolve_addr(network, &target).await?;
            network.set_blocked(addr, false).await;
        }
        Command::Blocked => {
            for addr in network.blocked_peers().await {
                println!("{}", addr);
            }
        }
        Command::History => {
            for m in network.chat_history().await {
                let scope = if m.is_private {
                    format!(" -> {}", m.recipient)
                } else {
                    String::new()
                };
                println!("[{}] {}{}: {}", m.timestamp.format("%H:%M:%S"), m.sender, scope, m.content);
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

/// A literal socket address, or the address of a connected peer with that name
async fn resolve_addr(network: &Network, target: &str) -> Result<SocketAddr, NetError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    network
        .list_active_peers()
        .await
        .into_iter()
        .find(|p| p.name == target)
        .map(|p| p.addr)
        .ok_or_else(|| NetError::PeerNotFound(target.to_string()))
}

pub fn describe_peer(p: &PeerInfo) -> String {
    let mut line = format!("{} ({}) {} [{}]", p.name, p.id, p.addr, p.state.as_str());
    if let Some(fp) = &p.session_fingerprint {
        line.push_str(&format!(" session {}", fp));
    }
    if p.blocked {
        line.push_str(" (blocked)");
    }
    line
}

pub fn describe_event(event: &NetEvent) -> String {
    match event {
        NetEvent::PeerConnected(p) => format!("* {} joined", describe_peer(p)),
        NetEvent::PeerDisconnected { name, .. } => format!("* {} left", name),
        NetEvent::PeerRenamed { old, new, .. } => format!("* {} is now {}", old, new),
        NetEvent::ChatReceived(m) if m.is_private => format!("[private] {}: {}", m.sender, m.content),
        NetEvent::ChatReceived(m) => format!("{}: {}", m.sender, m.content),
        NetEvent::FileOffered(t) => format!(
            "* {} offers {} ({} bytes); /accept {} or /reject {}",
            t.peer_name, t.file_name, t.file_size, t.file_id, t.file_id
        ),
        NetEvent::TransferFinished { file_id, status } => match status {
            TransferStatus::Completed => format!("* transfer {} completed", file_id),
            other => format!("* transfer {} {}", file_id, other),
        },
    }
}
