//! Async driver for a [`SipSession`].
//!
//! `login` spawns one tokio task that owns the session and its transport.
//! Everything reaches the session through that task: commands from
//! [`ClientHandle`], transport readiness and the periodic sweeps.

use crate::config::AccountConfig;
use crate::resolver;
use crate::session::{AccountDirectory, AccountEvent, SessionState, SipSession, StaticDirectory};
use crate::transport::{Transport, TransportProtocol, TcpTransport, UdpTransport};
use crate::{SipError, SipResult};
use futures::future;
use parking_lot::RwLock;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Requests from the account layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    SendMessage { peer: String, text: String },
    SetTyping { peer: String, typing: bool },
    SetStatus { note: String },
    AddBuddy { name: String },
    RemoveBuddy { name: String },
    Logout,
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: UnboundedSender<ClientCommand>,
    state: Arc<RwLock<SessionState>>,
}

impl ClientHandle {
    /// State as of the last event the driver handled.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn send(&self, command: ClientCommand) -> SipResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SipError::InvalidState("session has ended".to_string()))
    }

    pub fn send_message(&self, peer: &str, text: &str) -> SipResult<()> {
        self.send(ClientCommand::SendMessage {
            peer: peer.to_string(),
            text: text.to_string(),
        })
    }

    pub fn set_typing(&self, peer: &str, typing: bool) -> SipResult<()> {
        self.send(ClientCommand::SetTyping {
            peer: peer.to_string(),
            typing,
        })
    }

    pub fn set_status(&self, note: &str) -> SipResult<()> {
        self.send(ClientCommand::SetStatus {
            note: note.to_string(),
        })
    }

    pub fn add_buddy(&self, name: &str) -> SipResult<()> {
        self.send(ClientCommand::AddBuddy {
            name: name.to_string(),
        })
    }

    pub fn remove_buddy(&self, name: &str) -> SipResult<()> {
        self.send(ClientCommand::RemoveBuddy {
            name: name.to_string(),
        })
    }

    pub fn logout(&self) -> SipResult<()> {
        self.send(ClientCommand::Logout)
    }
}

pub type LoginResult = SipResult<(ClientHandle, UnboundedReceiver<AccountEvent>, JoinHandle<()>)>;

/// Starts a session using the roster and deny list from `config`.
/// Must be called from within a tokio runtime.
pub fn login(config: AccountConfig) -> LoginResult {
    let directory = StaticDirectory::from_config(&config);
    login_with_directory(config, Box::new(directory))
}

pub fn login_with_directory(config: AccountConfig, directory: Box<dyn AccountDirectory>) -> LoginResult {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = SipSession::new(config, directory, event_tx)?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let state = Arc::new(RwLock::new(session.state()));
    let task = tokio::spawn(run(session, command_rx, state.clone()));

    Ok((
        ClientHandle {
            commands: command_tx,
            state,
        },
        event_rx,
        task,
    ))
}

enum Wake {
    Command(Option<ClientCommand>),
    Transport(SipResult<()>),
    Resend,
    Subscribe,
    Keepalive,
}

async fn run(
    mut session: SipSession,
    mut commands: UnboundedReceiver<ClientCommand>,
    state: Arc<RwLock<SessionState>>,
) {
    if let Err(e) = connect(&mut session, &state).await {
        session.fail(&e);
        *state.write() = session.state();
        return;
    }
    *state.write() = session.state();

    let timers = session.config().timers.clone();
    let mut resend = periodic(timers.resend_sweep());
    let mut keepalive = periodic(timers.keepalive());
    let mut next_subscribe = subscribe_deadline(timers.subscribe_sweep(), timers.subscribe_jitter_ms);

    loop {
        let wake = {
            let transport_ready = async {
                match session.transport_mut() {
                    Some(transport) => transport.readiness().await,
                    None => future::pending::<SipResult<()>>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => Wake::Command(command),
                result = transport_ready => Wake::Transport(result),
                _ = resend.tick() => Wake::Resend,
                _ = time::sleep_until(next_subscribe) => Wake::Subscribe,
                _ = keepalive.tick() => Wake::Keepalive,
            }
        };

        let now = Instant::now();
        match wake {
            Wake::Command(Some(command)) => {
                if let Err(e) = apply(&mut session, command) {
                    warn!("Command failed: {}", e);
                }
            }
            Wake::Command(None) => {
                debug!("Every client handle was dropped, logging out");
                session.logout();
            }
            Wake::Transport(Ok(())) => session.drive_io(now),
            Wake::Transport(Err(e)) => session.fail(&e),
            Wake::Resend => session.on_resend_timer(now),
            Wake::Subscribe => {
                session.on_subscribe_timer(now);
                next_subscribe =
                    subscribe_deadline(timers.subscribe_sweep(), timers.subscribe_jitter_ms);
            }
            Wake::Keepalive => session.on_keepalive(),
        }

        if session.wants_write() {
            session.drive_io(now);
        }

        *state.write() = session.state();
        if session.state() == SessionState::Closed {
            break;
        }
    }

    info!("Session task finished");
}

fn apply(session: &mut SipSession, command: ClientCommand) -> SipResult<()> {
    match command {
        ClientCommand::SendMessage { peer, text } => session.send_message(&peer, &text),
        ClientCommand::SetTyping { peer, typing } => session.set_typing(&peer, typing),
        ClientCommand::SetStatus { note } => session.set_status(&note),
        ClientCommand::AddBuddy { name } => session.add_buddy(&name),
        ClientCommand::RemoveBuddy { name } => {
            session.remove_buddy(&name);
            Ok(())
        }
        ClientCommand::Logout => {
            session.logout();
            Ok(())
        }
    }
}

/// Interval whose first tick is one period from now.
fn periodic(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn subscribe_deadline(period: Duration, jitter_ms: u64) -> time::Instant {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ms)
    };
    time::Instant::now() + period + Duration::from_millis(jitter)
}

/// Resolves the server, opens the transport and starts registering.
async fn connect(session: &mut SipSession, state: &RwLock<SessionState>) -> SipResult<()> {
    session.begin_resolving()?;
    *state.write() = session.state();

    let (target, server) = resolver::resolve(session.config()).await?;
    session.begin_connecting(server)?;
    *state.write() = session.state();
    debug!("Using {}:{} at {}", target.host, target.port, server);

    let protocol = session.config().transport;
    let ports = session.config().listen_ports();
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let transport: Box<dyn Transport> = match protocol {
        TransportProtocol::Udp => Box::new(UdpTransport::bind(any, ports, server).await?),
        TransportProtocol::Tcp => Box::new(TcpTransport::bind(any, ports, server).await?),
    };

    let bound = transport.local_addr();
    let ip = match local_ip_towards(server).await {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Couldn't determine the local address facing {}: {}", server, e);
            bound.ip()
        }
    };
    let contact = SocketAddr::new(ip, bound.port());
    info!("Reachable at {} over {}", contact, protocol);

    session.attach_transport(transport, contact, Instant::now())
}

/// Address of the interface the OS routes `server` through.
async fn local_ip_towards(server: SocketAddr) -> SipResult<IpAddr> {
    let unspecified: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let probe = UdpSocket::bind(unspecified).await?;
    probe.connect(server).await?;
    Ok(probe.local_addr()?.ip())
}
