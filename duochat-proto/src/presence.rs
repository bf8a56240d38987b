//! Presence status types for online/offline tracking.

use serde::{Deserialize, Serialize};

use crate::message::Timestamp;

/// Presence status of a user as derived from the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    /// User has a socket registered with the relay (or is within its grace period).
    Online,
    /// User is absent from the roster.
    Offline,
}

impl PresenceStatus {
    /// Maps a roster membership flag to a status.
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Sidebar status of a conversation partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Whether the user is on the current roster.
    pub online: bool,
    /// Creation time of the newest message exchanged with the user.
    pub last_seen: Option<Timestamp>,
}

impl UserStatus {
    /// Returns the presence status implied by this entry.
    #[must_use]
    pub const fn status(&self) -> PresenceStatus {
        PresenceStatus::from_online(self.online)
    }
}
