//! Message types shared by the `DuoChat` server and its clients.
//!
//! Field names follow the JSON shape the browser client expects
//! (`_id`, `senderId`, `receiverId`, `createdAt`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum accepted request body size in bytes (4 MiB).
///
/// Image messages carry a URL, but the body limit leaves room for inline
/// data URIs forwarded by older clients.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Logical identity of a user.
///
/// Opaque to the relay: it is whatever the upstream auth layer asserts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the empty identifier, which never names a user.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A persisted direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique identifier for this message.
    #[serde(rename = "_id")]
    pub id: MessageId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Recipient of the message.
    pub receiver_id: UserId,
    /// Text body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// URL of an already-hosted image, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Whether the recipient has opened the message.
    #[serde(default)]
    pub seen: bool,
    /// When the server accepted the message.
    pub created_at: Timestamp,
}

impl ChatMessage {
    /// Builds an unseen message stamped with the current time.
    #[must_use]
    pub fn new(sender_id: UserId, receiver_id: UserId, body: NewMessage) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            receiver_id,
            text: body.text.filter(|t| !t.is_empty()),
            image: body.image.filter(|i| !i.is_empty()),
            seen: false,
            created_at: Timestamp::now(),
        }
    }

    /// Returns the other participant of the conversation, seen from `me`.
    #[must_use]
    pub fn partner_of(&self, me: &UserId) -> &UserId {
        if &self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Request body for sending a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// URL of an already-hosted image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text nor image was provided.
    #[error("message has neither text nor image")]
    EmptyMessage,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl NewMessage {
    /// Creates a text-only message body.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Creates an image-only message body.
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            text: None,
            image: Some(url.into()),
        }
    }

    /// Validates the body against `max` bytes of combined content.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyMessage`] when both fields are empty,
    /// or [`ValidationError::TooLarge`] when the content exceeds `max`.
    pub fn validate(&self, max: usize) -> Result<(), ValidationError> {
        let text_len = self.text.as_deref().map_or(0, str::len);
        let image_len = self.image.as_deref().map_or(0, str::len);
        if text_len == 0 && image_len == 0 {
            return Err(ValidationError::EmptyMessage);
        }
        let size = text_len + image_len;
        if size > max {
            return Err(ValidationError::TooLarge { size, max });
        }
        Ok(())
    }
}
