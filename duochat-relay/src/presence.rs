//! The presence map: which user is reachable over which socket.
//!
//! Each user has at most one entry. An entry is either `Active`, holding the
//! channel that feeds the user's WebSocket writer task, or `Lingering`, kept
//! on the roster for a grace period after the socket dropped so that a quick
//! reconnect does not flap the user offline and back online.
//!
//! Every entry remembers the [`ConnectionId`] that created it. Disconnect and
//! expiry requests carry the id of the connection they refer to and are
//! ignored when a newer connection has taken over in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use duochat_proto::codec;
use duochat_proto::event::ServerEvent;
use duochat_proto::message::UserId;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

/// Channel feeding a single WebSocket writer task.
pub type EventSender = mpsc::UnboundedSender<Message>;

/// Process-unique identifier of one accepted WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
enum Liveness {
    Active(EventSender),
    Lingering { deadline: Instant },
}

#[derive(Debug)]
struct Entry {
    conn: ConnectionId,
    liveness: Liveness,
}

/// Result of [`PresenceMap::connect`].
#[derive(Debug)]
pub struct Connected {
    /// Identifier assigned to the new connection.
    pub conn: ConnectionId,
    /// `true` when another socket of the same user was active.
    ///
    /// That socket stays open but no longer receives events; its eventual
    /// disconnect is reported as [`Disconnect::Stale`].
    pub replaced: bool,
    /// `true` when the user was not on the roster before this connection.
    pub joined: bool,
}

/// Result of [`PresenceMap::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// A newer connection owns the entry; nothing changed.
    Stale,
    /// The user stays on the roster until `until`, unless they reconnect.
    Lingering {
        /// When the grace period ends.
        until: Instant,
    },
    /// The user was removed from the roster.
    Removed,
}

/// Server-held association between users and their live sockets.
#[derive(Debug)]
pub struct PresenceMap {
    entries: RwLock<HashMap<UserId, Entry>>,
    next_conn: AtomicU64,
    grace: Duration,
}

impl Default for PresenceMap {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl PresenceMap {
    /// Creates an empty map with the given reconnection grace period.
    ///
    /// A zero grace period removes users as soon as their socket closes.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            grace,
        }
    }

    /// Registers a new socket for `user`, replacing whatever entry existed.
    pub async fn connect(&self, user: &UserId, sender: EventSender) -> Connected {
        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            conn,
            liveness: Liveness::Active(sender),
        };
        let previous = self.entries.write().await.insert(user.clone(), entry);

        let (replaced, joined) = match previous {
            None => (false, true),
            Some(Entry {
                liveness: Liveness::Active(_),
                ..
            }) => (true, false),
            Some(Entry {
                liveness: Liveness::Lingering { .. },
                ..
            }) => (false, false),
        };
        Connected {
            conn,
            replaced,
            joined,
        }
    }

    /// Records that connection `conn` of `user` has closed.
    pub async fn disconnect(&self, user: &UserId, conn: ConnectionId) -> Disconnect {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(user) else {
            return Disconnect::Stale;
        };
        if entry.conn != conn || matches!(entry.liveness, Liveness::Lingering { .. }) {
            return Disconnect::Stale;
        }
        if self.grace.is_zero() {
            entries.remove(user);
            return Disconnect::Removed;
        }
        let until = Instant::now() + self.grace;
        entry.liveness = Liveness::Lingering { deadline: until };
        drop(entries);
        Disconnect::Lingering { until }
    }

    /// Ends the grace period of `conn`, returning `true` if the user left
    /// the roster as a result.
    pub async fn expire(&self, user: &UserId, conn: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        let lingering = entries.get(user).is_some_and(|entry| {
            entry.conn == conn && matches!(entry.liveness, Liveness::Lingering { .. })
        });
        if lingering {
            entries.remove(user);
        }
        lingering
    }

    /// Removes every lingering entry whose deadline has passed.
    ///
    /// Returns the users that left the roster.
    pub async fn sweep(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let expired: Vec<UserId> = entries
            .iter()
            .filter_map(|(user, entry)| match entry.liveness {
                Liveness::Lingering { deadline } if deadline <= now => Some(user.clone()),
                _ => None,
            })
            .collect();
        for user in &expired {
            entries.remove(user);
        }
        expired
    }

    /// Returns the live sender for `user`, if the user has an active socket.
    pub async fn sender_for(&self, user: &UserId) -> Option<EventSender> {
        let entries = self.entries.read().await;
        match entries.get(user).map(|e| &e.liveness) {
            Some(Liveness::Active(sender)) => Some(sender.clone()),
            _ => None,
        }
    }

    /// Returns `true` if `user` is on the roster (active or lingering).
    pub async fn is_online(&self, user: &UserId) -> bool {
        self.entries.read().await.contains_key(user)
    }

    /// Returns the roster, sorted by user id.
    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.entries.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Number of users on the roster.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if nobody is on the roster.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Pushes `event` to `user` if they have an active socket.
    ///
    /// Returns `true` if the event was handed to the socket's writer task.
    /// Delivery beyond that point is best-effort.
    pub async fn send_event(&self, user: &UserId, event: &ServerEvent) -> bool {
        let Some(sender) = self.sender_for(user).await else {
            return false;
        };
        let Some(frame) = event_frame(event) else {
            return false;
        };
        sender.send(frame).is_ok()
    }

    /// Pushes `event` to every active socket, returning how many accepted it.
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        let Some(frame) = event_frame(event) else {
            return 0;
        };
        let entries = self.entries.read().await;
        entries
            .values()
            .filter_map(|entry| match &entry.liveness {
                Liveness::Active(sender) => Some(sender),
                Liveness::Lingering { .. } => None,
            })
            .filter(|sender| sender.send(frame.clone()).is_ok())
            .count()
    }

    /// Broadcasts the current roster as a `getOnlineUsers` event.
    pub async fn broadcast_roster(&self) -> usize {
        let roster = ServerEvent::OnlineUsers(self.online_users().await);
        self.broadcast(&roster).await
    }

    /// Sends a Close frame to every active socket.
    pub async fn close_all(&self) {
        let entries = self.entries.read().await;
        for (user, entry) in entries.iter() {
            if let Liveness::Active(sender) = &entry.liveness {
                tracing::info!(user_id = %user, conn = %entry.conn, "sending close frame");
                let _ = sender.send(Message::Close(None));
            }
        }
    }
}

/// Encodes a server event as a WebSocket text frame.
pub fn event_frame(event: &ServerEvent) -> Option<Message> {
    match codec::encode_server(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode server event");
            None
        }
    }
}
