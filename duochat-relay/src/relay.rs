//! Relay server core: shared state, WebSocket handler, and server startup.
//!
//! A client opens `GET /ws?userId=<id>`. The socket is entered into the
//! [`PresenceMap`], the online roster is announced, and from then on the
//! socket receives live events for its user: messages persisted through the
//! HTTP API, messages relayed from the partner's socket, and read receipts.
//! Nothing is queued for users without an active socket; they pick up
//! history on their next fetch.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use duochat_proto::codec;
use duochat_proto::event::{ClientEvent, ServerEvent};
use duochat_proto::message::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::api;
use crate::config::RelayConfig;
use crate::presence::{ConnectionId, Disconnect, EventSender, PresenceMap, event_frame};
use crate::store::MessageStore;
use crate::users::UserDirectory;

/// Timing and size limits applied by the relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Maximum request body and text frame size in bytes.
    pub max_payload_size: usize,
    /// How long a dropped user stays on the roster awaiting a reconnect.
    pub grace_period: Duration,
    /// Interval between roster re-announcements, if enabled.
    pub roster_interval: Option<Duration>,
    /// Interval between server pings, if enabled.
    pub ping_interval: Option<Duration>,
    /// Inbound silence after which a socket is dropped, if enabled.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
            grace_period: config.grace_period,
            roster_interval: config.roster_interval,
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Shared relay server state.
#[derive(Debug)]
pub struct RelayState {
    /// Which user is reachable over which socket.
    pub presence: PresenceMap,
    /// Conversation history.
    pub store: MessageStore,
    /// Known users for the sidebar.
    pub users: UserDirectory,
    /// Limits and timers.
    pub settings: RelaySettings,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with default settings and empty collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(RelaySettings::default(), MessageStore::new(), UserDirectory::new())
    }

    /// Creates a relay state with explicit settings, store, and directory.
    #[must_use]
    pub fn with_settings(settings: RelaySettings, store: MessageStore, users: UserDirectory) -> Self {
        Self {
            presence: PresenceMap::new(settings.grace_period),
            store,
            users,
            settings,
        }
    }

    /// Builds the state described by a resolved [`RelayConfig`].
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::with_settings(
            RelaySettings::from(config),
            MessageStore::with_max_history(config.max_history),
            UserDirectory::with_profiles(config.users.iter().cloned()),
        )
    }

    /// Broadcasts the roster to every active socket.
    pub async fn announce_roster(&self) {
        let reached = self.presence.broadcast_roster().await;
        tracing::debug!(sockets = reached, "roster announced");
    }
}

/// Query string of the WebSocket handshake.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ConnectQuery {
    /// The connecting user; absent or empty for anonymous sockets.
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Enter the user into the presence map. An older socket of the same
///    user stays open but stops receiving events.
/// 2. Announce the roster (to everybody if the user just came online).
/// 3. Run a writer task (outbound channel plus keep-alive pings) and a
///    reader task (client events, idle timeout) until either ends.
/// 4. Report the disconnect to the presence map; start the grace timer or
///    announce the user's departure.
///
/// Anonymous sockets skip steps 1, 2 and 4 and can only ping and read the
/// roster.
pub async fn handle_socket(socket: WebSocket, user: Option<UserId>, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = match &user {
        Some(user) => Some(register(&state, user, tx.clone()).await),
        None => {
            tracing::info!("anonymous socket connected");
            None
        }
    };

    // Writer: forward queued frames and send keep-alive pings.
    let ping_interval = state.settings.ping_interval;
    let mut write_task = tokio::spawn(async move {
        let mut ticker = ping_interval.map(|p| tokio::time::interval_at(Instant::now() + p, p));
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let closing = matches!(frame, Message::Close(_));
                    if ws_sender.send(frame).await.is_err() {
                        tracing::warn!("WebSocket write failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                () = next_tick(ticker.as_mut()) => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        tracing::debug!("ping failed, closing writer");
                        break;
                    }
                }
            }
        }
    });

    // Reader: decode client events until close, error, or idle timeout.
    let reader_user = user.clone();
    let reader_state = Arc::clone(&state);
    let idle_timeout = state.settings.idle_timeout;
    let mut read_task = tokio::spawn(async move {
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::info!(user_id = ?reader_user, "socket idle, dropping");
                        break;
                    }
                },
                None => ws_receiver.next().await,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    handle_text(reader_user.as_ref(), text.as_str(), &tx, &reader_state).await;
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::debug!(user_id = ?reader_user, "received close frame");
                    break;
                }
                Some(Ok(_)) => {
                    // Binary, ping and pong frames only count as activity.
                }
                Some(Err(e)) => {
                    tracing::debug!(user_id = ?reader_user, error = %e, "WebSocket read error");
                    break;
                }
                None => break,
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if let (Some(user), Some(conn)) = (user, conn) {
        on_disconnect(&state, user, conn).await;
    }
}

/// Enters `user` into the presence map and announces the roster.
async fn register(state: &Arc<RelayState>, user: &UserId, tx: EventSender) -> ConnectionId {
    state.users.touch(user).await;
    let connected = state.presence.connect(user, tx.clone()).await;
    tracing::info!(user_id = %user, conn = %connected.conn, joined = connected.joined, "user connected");

    if connected.replaced {
        // The older socket stays open; events now route to this one.
        tracing::info!(user_id = %user, conn = %connected.conn, "superseding existing socket");
    }

    if connected.joined {
        state.announce_roster().await;
    } else {
        // Roster membership is unchanged; only the new socket needs it.
        let roster = ServerEvent::OnlineUsers(state.presence.online_users().await);
        reply(&tx, &roster);
    }
    connected.conn
}

/// Records a closed socket and schedules the end of its grace period.
async fn on_disconnect(state: &Arc<RelayState>, user: UserId, conn: ConnectionId) {
    match state.presence.disconnect(&user, conn).await {
        Disconnect::Stale => {
            tracing::debug!(user_id = %user, conn = %conn, "superseded socket closed");
        }
        Disconnect::Removed => {
            tracing::info!(user_id = %user, conn = %conn, "user disconnected");
            state.announce_roster().await;
        }
        Disconnect::Lingering { until } => {
            tracing::info!(
                user_id = %user,
                conn = %conn,
                grace_ms = state.settings.grace_period.as_millis(),
                "user disconnected, awaiting reconnect"
            );
            let state = Arc::clone(state);
            tokio::spawn(async move {
                tokio::time::sleep_until(until).await;
                if state.presence.expire(&user, conn).await {
                    tracing::info!(user_id = %user, conn = %conn, "grace period over, user offline");
                    state.announce_roster().await;
                }
            });
        }
    }
}

/// Handles one text frame from a socket.
async fn handle_text(user: Option<&UserId>, text: &str, tx: &EventSender, state: &Arc<RelayState>) {
    if text.len() > state.settings.max_payload_size {
        tracing::warn!(
            user_id = ?user,
            size = text.len(),
            max = state.settings.max_payload_size,
            "frame exceeds size limit"
        );
        reply(
            tx,
            &ServerEvent::Error {
                reason: format!(
                    "payload too large: {} bytes (max {})",
                    text.len(),
                    state.settings.max_payload_size
                ),
            },
        );
        return;
    }

    let event = match codec::decode_client(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(user_id = ?user, error = %e, "failed to decode client event");
            reply(
                tx,
                &ServerEvent::Error {
                    reason: format!("malformed event: {e}"),
                },
            );
            return;
        }
    };

    match event {
        ClientEvent::SendMessage {
            mut message,
            receiver_id,
        } => {
            let Some(user) = user else {
                reply(
                    tx,
                    &ServerEvent::Error {
                        reason: "anonymous sockets cannot relay messages".to_string(),
                    },
                );
                return;
            };
            // The socket's own identity is authoritative for the sender.
            message.sender_id = user.clone();
            let relayed = state
                .presence
                .send_event(&receiver_id, &ServerEvent::MessageReceived(message))
                .await;
            if relayed {
                tracing::debug!(from = %user, to = %receiver_id, "message relayed");
            } else {
                tracing::debug!(from = %user, to = %receiver_id, "receiver offline, left for next fetch");
            }
        }
        ClientEvent::GetOnlineUsers => {
            let roster = ServerEvent::OnlineUsers(state.presence.online_users().await);
            reply(tx, &roster);
        }
        ClientEvent::Ping => reply(tx, &ServerEvent::Pong),
    }
}

/// Queues an event on this socket's own writer.
fn reply(tx: &EventSender, event: &ServerEvent) {
    if let Some(frame) = event_frame(event) {
        let _ = tx.send(frame);
    }
}

/// Resolves on the next tick of an optional interval, or never.
async fn next_tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Periodically re-announces the roster so clients that missed an update
/// converge.
async fn announce_periodically(state: Arc<RelayState>) {
    let Some(period) = state.settings.roster_interval else {
        return std::future::pending().await;
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let expired = state.presence.sweep().await;
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept lingering users");
        }
        state.announce_roster().await;
    }
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    let user = query.user_id.filter(|id| !id.is_empty()).map(UserId::new);
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

/// Builds the full router: the socket endpoint plus the message API.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .merge(api::routes(state.settings.max_payload_size))
        .with_state(state)
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// The returned task also drives the periodic roster re-announcement;
/// aborting it stops both.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "relay server error");
                }
            }
            () = announce_periodically(state) => {}
        }
    });

    Ok((bound_addr, handle))
}
