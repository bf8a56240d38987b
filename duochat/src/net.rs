//! Session driver wiring the front end to the relay.
//!
//! [`spawn_net`] signs in (opens the socket and loads the user list) and
//! then hands everything to a background supervisor task. The front end
//! talks to it through two channels:
//!
//! ```text
//! front end  ←── NetEvent ───  supervisor task (socket + HTTP API + ChatState)
//!            ─── NetCommand →
//! ```
//!
//! Messages are persisted through the HTTP API; the socket only carries
//! live events. When the socket drops the supervisor keeps serving commands
//! over HTTP and reconnects with exponential backoff, then reloads the user
//! list and the open conversation to pick up anything missed meanwhile.

use std::collections::HashMap;
use std::time::Duration;

use duochat_proto::api::UserProfile;
use duochat_proto::event::{ClientEvent, ServerEvent};
use duochat_proto::presence::UserStatus;
use duochat_proto::message::{ChatMessage, MessageId, NewMessage, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api::{ApiClient, ApiError};
use crate::config::ReconnectConfig;
use crate::state::{Action, ChatState};
use crate::transport::{CONNECT_TIMEOUT, SocketTransport, TransportError};

/// Default channel capacity for commands and events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default number of message ids remembered for duplicate suppression.
const DEFAULT_MAX_DUPLICATE_TRACKING: usize = 10_000;

/// Commands sent from the front end to the supervisor.
#[derive(Debug)]
pub enum NetCommand {
    /// Open the conversation with this user and load its history.
    Select(UserId),
    /// Send a message to the open conversation's partner.
    Send(NewMessage),
    /// Reload the user list and unseen counters.
    RefreshUsers,
    /// Close the socket and stop the supervisor.
    Shutdown,
}

/// Events sent from the supervisor to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// The socket went up or down.
    ConnectionStatus {
        /// Whether the socket is open.
        connected: bool,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Fresh user list from the server.
    UsersUpdated {
        /// Everyone except the signed-in user.
        users: Vec<UserProfile>,
        /// Unseen message counts by sender.
        unseen: HashMap<UserId, usize>,
        /// Roster membership and last activity per user.
        statuses: HashMap<UserId, UserStatus>,
    },
    /// The online roster changed.
    RosterUpdated(Vec<UserId>),
    /// The open conversation was (re)loaded.
    ConversationLoaded {
        /// The conversation partner.
        partner: UserId,
        /// History, oldest first.
        messages: Vec<ChatMessage>,
    },
    /// A message this client sent was persisted.
    MessageSent(ChatMessage),
    /// A message was appended to the open conversation by the server.
    MessageReceived(ChatMessage),
    /// A message for another conversation arrived.
    Unseen {
        /// The sender.
        from: UserId,
        /// Unseen messages from that sender.
        count: usize,
    },
    /// The partner read every message we sent them.
    ConversationSeen {
        /// The reader.
        by: UserId,
    },
    /// The partner read one message.
    MessageSeen(MessageId),
    /// A non-fatal error.
    Error(String),
}

/// Errors from [`spawn_net`].
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The message API could not be reached or refused the sign-in.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The socket could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Configuration for the networking layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// HTTP base URL of the relay server (e.g., `http://127.0.0.1:5000`).
    pub server_url: String,
    /// The signed-in user.
    pub user: UserId,
    /// Conversation to open right after signing in.
    pub partner: Option<UserId>,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,
    /// Backoff policy for socket reconnects.
    pub reconnect: ReconnectConfig,
    /// Number of message ids remembered for duplicate suppression.
    pub max_duplicate_tracking: usize,
}

impl NetConfig {
    /// Creates a `NetConfig` with default timeouts and capacities.
    #[must_use]
    pub fn new(server_url: String, user: UserId) -> Self {
        Self {
            server_url,
            user,
            partner: None,
            connect_timeout: CONNECT_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reconnect: ReconnectConfig::default(),
            max_duplicate_tracking: DEFAULT_MAX_DUPLICATE_TRACKING,
        }
    }
}

/// Signs in and spawns the supervisor task.
///
/// The first [`NetEvent`]s on the returned receiver are
/// `ConnectionStatus { connected: true }` and `UsersUpdated`, followed by
/// `ConversationLoaded` when [`NetConfig::partner`] is set.
///
/// # Errors
///
/// Returns [`NetError`] if the socket cannot be opened or the user list
/// cannot be loaded.
pub async fn spawn_net(
    config: NetConfig,
) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>), NetError> {
    let api = ApiClient::new(&config.server_url, config.user.clone())?;
    let transport = SocketTransport::connect_with_timeout(
        &config.server_url,
        config.user.clone(),
        config.connect_timeout,
    )
    .await?;
    let users = api.users().await?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel::<NetEvent>(config.channel_capacity);

    let mut state =
        ChatState::with_duplicate_tracking(config.user.clone(), config.max_duplicate_tracking);
    state.set_users(users.users, users.unseen_messages);
    let mut session = Session {
        state,
        config,
        api,
        events: evt_tx,
    };

    tokio::spawn(async move {
        session.emit(NetEvent::ConnectionStatus { connected: true }).await;
        session.emit_users().await;
        if let Some(partner) = session.config.partner.clone() {
            session.select(partner).await;
        }
        supervise(session, transport, cmd_rx).await;
    });

    Ok((cmd_tx, evt_rx))
}

/// Everything the supervisor owns besides the socket.
struct Session {
    config: NetConfig,
    api: ApiClient,
    state: ChatState,
    events: mpsc::Sender<NetEvent>,
}

impl Session {
    async fn emit(&self, event: NetEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("front end dropped the event channel");
        }
    }

    async fn emit_users(&self) {
        let unseen = self
            .state
            .users()
            .iter()
            .map(|u| (u.id.clone(), self.state.unseen_from(&u.id)))
            .filter(|(_, count)| *count > 0)
            .collect();
        self.emit(NetEvent::UsersUpdated {
            users: self.state.users().to_vec(),
            unseen,
            statuses: self.state.statuses().into_iter().collect(),
        })
        .await;
    }

    async fn refresh_users(&mut self) {
        match self.api.users().await {
            Ok(body) => {
                self.state.set_users(body.users, body.unseen_messages);
                self.emit_users().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load users");
                self.emit(NetEvent::Error(format!("failed to load users: {e}"))).await;
            }
        }
    }

    async fn select(&mut self, partner: UserId) {
        self.state.select(partner.clone());
        match self.api.messages(&partner).await {
            Ok(messages) => {
                self.state.set_messages(messages);
                self.emit(NetEvent::ConversationLoaded {
                    partner,
                    messages: self.state.messages().to_vec(),
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(partner = %partner, error = %e, "failed to load conversation");
                self.emit(NetEvent::Error(format!("failed to load conversation: {e}")))
                    .await;
            }
        }
    }

    async fn send(&mut self, body: NewMessage, transport: Option<&SocketTransport>) {
        let Some(partner) = self.state.selected().cloned() else {
            self.emit(NetEvent::Error("no conversation selected".to_string())).await;
            return;
        };
        let message = match self.api.send(&partner, &body).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(to = %partner, error = %e, "send failed");
                self.emit(NetEvent::Error(format!("send failed: {e}"))).await;
                return;
            }
        };
        if self.state.push_sent(message.clone()) {
            self.emit(NetEvent::MessageSent(message.clone())).await;
        }

        // Tell the partner's socket right away; the server relays it.
        if let Some(transport) = transport {
            let hint = ClientEvent::SendMessage {
                message,
                receiver_id: partner,
            };
            if let Err(e) = transport.send(&hint).await {
                tracing::debug!(error = %e, "relay hint not sent");
            }
        }
    }

    async fn handle_command(&mut self, cmd: NetCommand, transport: Option<&SocketTransport>) {
        match cmd {
            NetCommand::Select(partner) => self.select(partner).await,
            NetCommand::Send(body) => self.send(body, transport).await,
            NetCommand::RefreshUsers => self.refresh_users().await,
            NetCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        tracing::trace!(event = event.name(), "server event");
        match event {
            ServerEvent::Error { reason } => {
                tracing::warn!(reason = %reason, "server reported an error");
                self.emit(NetEvent::Error(reason)).await;
            }
            ServerEvent::Pong => {}
            ServerEvent::OnlineUsers(roster) => {
                self.state.set_online(roster.clone());
                self.emit(NetEvent::RosterUpdated(roster)).await;
            }
            ServerEvent::MessagesSeen { by } => {
                self.state.apply(ServerEvent::MessagesSeen { by: by.clone() });
                self.emit(NetEvent::ConversationSeen { by }).await;
            }
            ServerEvent::MessageSeen { message_id } => {
                self.state.apply(ServerEvent::MessageSeen { message_id });
                self.emit(NetEvent::MessageSeen(message_id)).await;
            }
            ServerEvent::NewMessage(message) | ServerEvent::MessageReceived(message) => {
                self.incoming(message).await;
            }
        }
    }

    async fn incoming(&mut self, message: ChatMessage) {
        let id = message.id;
        let sender = message.sender_id.clone();
        let action = self.state.apply(ServerEvent::NewMessage(message));

        if let Some(shown) = self.state.messages().last().filter(|m| m.id == id) {
            self.emit(NetEvent::MessageReceived(shown.clone())).await;
        }

        match action {
            Some(Action::MarkSeen(id)) => {
                if let Err(e) = self.api.mark_seen(id).await {
                    tracing::warn!(message_id = %id, error = %e, "failed to mark message seen");
                }
            }
            Some(Action::RefreshUsers) => {
                self.emit(NetEvent::Unseen {
                    count: self.state.unseen_from(&sender),
                    from: sender,
                })
                .await;
                self.refresh_users().await;
            }
            None => {}
        }
    }

    /// Reloads what the socket may have missed while it was down.
    async fn resync(&mut self) {
        self.refresh_users().await;
        if let Some(partner) = self.state.selected().cloned() {
            self.select(partner).await;
        }
    }
}

/// Waits for the next server event, or forever without a socket.
async fn next_event(transport: Option<&SocketTransport>) -> Result<ServerEvent, TransportError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves at `deadline`, or never.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Supervisor loop: serves commands, forwards socket events, and
/// reconnects with backoff when the socket drops.
async fn supervise(
    mut session: Session,
    transport: SocketTransport,
    mut commands: mpsc::Receiver<NetCommand>,
) {
    let mut transport = Some(transport);
    let mut attempts: u32 = 0;
    let mut retry_at: Option<Instant> = None;

    loop {
        if session.events.is_closed() {
            tracing::debug!("front end gone, stopping supervisor");
            break;
        }

        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    None | Some(NetCommand::Shutdown) => {
                        tracing::info!("net supervisor shutting down");
                        break;
                    }
                    Some(cmd) => session.handle_command(cmd, transport.as_ref()).await,
                }
            }
            event = next_event(transport.as_ref()) => {
                match event {
                    Ok(event) => session.handle_event(event).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "socket lost");
                        transport = None;
                        session.emit(NetEvent::ConnectionStatus { connected: false }).await;
                        attempts = 0;
                        let delay = session.config.reconnect.delay_for(1);
                        retry_at = Some(Instant::now() + delay);
                        session.emit(NetEvent::Reconnecting { attempt: 1, delay }).await;
                    }
                }
            }
            () = wait_until(retry_at) => {
                attempts += 1;
                let result = SocketTransport::connect_with_timeout(
                    &session.config.server_url,
                    session.config.user.clone(),
                    session.config.connect_timeout,
                )
                .await;
                let policy = session.config.reconnect.clone();
                match result {
                    Ok(fresh) => {
                        tracing::info!(attempts, "socket reconnected");
                        transport = Some(fresh);
                        attempts = 0;
                        retry_at = None;
                        session.emit(NetEvent::ConnectionStatus { connected: true }).await;
                        session.resync().await;
                    }
                    Err(e) if policy.allows(attempts) => {
                        let delay = policy.delay_for(attempts + 1);
                        tracing::debug!(attempt = attempts, error = %e, ?delay, "reconnect failed");
                        retry_at = Some(Instant::now() + delay);
                        session
                            .emit(NetEvent::Reconnecting { attempt: attempts + 1, delay })
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(attempts, error = %e, "giving up on reconnecting");
                        session
                            .emit(NetEvent::Error(format!(
                                "could not reconnect after {attempts} attempts: {e}"
                            )))
                            .await;
                        break;
                    }
                }
            }
        }
    }

    if let Some(transport) = transport {
        transport.close().await;
    }
}
