// main.rs - Command line SIP/SIMPLE client

use anyhow::{bail, Context, Result};
use sip_simple_rs::utils::user_part;
use sip_simple_rs::{login, AccountConfig, AccountEvent, ClientCommand};
use std::io;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::{LinesStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "commands: /msg <peer> <text>, /typing <peer> on|off, /status <note>, /add <peer>, /remove <peer>, /quit";

enum Input {
    Line(io::Result<String>),
    EndOfInput,
    Event(AccountEvent),
}

/// Parses one line of user input. Empty lines yield nothing.
fn parse_command(line: &str) -> Result<Option<ClientCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match verb {
        "/msg" => match rest.split_once(' ') {
            Some((peer, text)) => ClientCommand::SendMessage {
                peer: peer.to_string(),
                text: text.trim().to_string(),
            },
            None => bail!("usage: /msg <peer> <text>"),
        },
        "/typing" => match rest.split_once(' ') {
            Some((peer, "on")) => ClientCommand::SetTyping {
                peer: peer.to_string(),
                typing: true,
            },
            Some((peer, "off")) => ClientCommand::SetTyping {
                peer: peer.to_string(),
                typing: false,
            },
            _ => bail!("usage: /typing <peer> on|off"),
        },
        "/status" if !rest.is_empty() => ClientCommand::SetStatus {
            note: rest.to_string(),
        },
        "/add" if !rest.is_empty() => ClientCommand::AddBuddy {
            name: rest.to_string(),
        },
        "/remove" if !rest.is_empty() => ClientCommand::RemoveBuddy {
            name: rest.to_string(),
        },
        "/quit" => ClientCommand::Logout,
        _ => bail!("{}", USAGE),
    };
    Ok(Some(command))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sip_simple_rs=debug,sip_simple=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SIMPLE_CONFIG").ok())
        .context("usage: sip-simple <account.json> (or set SIMPLE_CONFIG)")?;
    let config = AccountConfig::from_file(&path)
        .with_context(|| format!("loading account from {}", path))?;

    info!("Starting SIP/SIMPLE client for {}", config.username);
    let (handle, events, task) = login(config)?;

    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines())
        .map(Input::Line)
        .chain(tokio_stream::once(Input::EndOfInput));
    let events = UnboundedReceiverStream::new(events).map(Input::Event);
    let mut inputs = lines.merge(events);

    while let Some(input) = inputs.next().await {
        match input {
            Input::Line(Ok(line)) => match parse_command(&line) {
                Ok(Some(command)) => {
                    if let Err(e) = handle.send(command) {
                        warn!("{}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => println!("{}", e),
            },
            Input::Line(Err(e)) => {
                error!("Reading input failed: {}", e);
                handle.logout()?;
            }
            Input::EndOfInput => {
                info!("End of input, logging out");
                // the session may already be gone
                let _ = handle.logout();
            }
            Input::Event(event) => match event {
                AccountEvent::Connected => println!("* connected"),
                AccountEvent::IncomingMessage { peer, text } => {
                    println!("<{}> {}", user_part(&peer), text)
                }
                AccountEvent::Typing { peer, typing } => {
                    if typing {
                        println!("* {} is typing", user_part(&peer));
                    }
                }
                AccountEvent::StatusText { peer, status } => {
                    println!("* {} ({}) is {}", user_part(&peer), peer, status)
                }
                AccountEvent::RosterImported { contacts } => {
                    for contact in contacts {
                        println!(
                            "* buddy {} {}",
                            contact.uri,
                            contact.name.as_deref().unwrap_or_default()
                        );
                    }
                }
                AccountEvent::OperationTimedOut { method, target } => {
                    warn!("{} to {} went unanswered", method, target)
                }
                AccountEvent::ConnectionError { reason } => {
                    error!("Connection error: {}", reason);
                    break;
                }
                AccountEvent::Disconnected => {
                    println!("* disconnected");
                    break;
                }
            },
        }
    }

    task.await.context("session task panicked")?;
    info!("Client shutdown complete");
    Ok(())
}
