//! Socket event types exchanged between clients and the relay server.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`, mirroring the named events a
//! browser socket client listens for.

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, MessageId, UserId};

/// Events pushed from the relay server to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// The current online roster, sorted by user id.
    #[serde(rename = "getOnlineUsers")]
    OnlineUsers(Vec<UserId>),

    /// A message persisted through the HTTP API.
    #[serde(rename = "newMessage")]
    NewMessage(ChatMessage),

    /// A message relayed from the sender's socket.
    #[serde(rename = "messageReceived")]
    MessageReceived(ChatMessage),

    /// The given user opened the conversation; all of my messages to them
    /// are now seen.
    #[serde(rename = "messagesSeen")]
    MessagesSeen {
        /// The reader.
        by: UserId,
    },

    /// A single message was marked seen by its recipient.
    #[serde(rename = "messageSeen")]
    MessageSeen {
        /// The message that was seen.
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },

    /// Reply to [`ClientEvent::Ping`].
    #[serde(rename = "pong")]
    Pong,

    /// The server could not act on a client event.
    #[serde(rename = "error")]
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl ServerEvent {
    /// Returns the wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OnlineUsers(_) => "getOnlineUsers",
            Self::NewMessage(_) => "newMessage",
            Self::MessageReceived(_) => "messageReceived",
            Self::MessagesSeen { .. } => "messagesSeen",
            Self::MessageSeen { .. } => "messageSeen",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// Events sent from a client to the relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Ask the relay to push an already-persisted message to its receiver.
    ///
    /// The server overwrites `message.sender_id` with the socket's user.
    #[serde(rename = "sendMessage")]
    SendMessage {
        /// The persisted message.
        message: ChatMessage,
        /// Who should receive it.
        #[serde(rename = "receiverId")]
        receiver_id: UserId,
    },

    /// Request a roster snapshot.
    #[serde(rename = "getOnlineUsers")]
    GetOnlineUsers,

    /// Application-level keep-alive.
    #[serde(rename = "ping")]
    Ping,
}
