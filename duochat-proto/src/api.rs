//! JSON bodies of the message HTTP API.
//!
//! Every response carries a `success` flag; failures carry a `message`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, UserId};

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const USER_HEADER: &str = "x-user-id";

/// Public profile of a conversation partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// The user's identity.
    #[serde(rename = "_id")]
    pub id: UserId,
    /// Display name.
    pub full_name: String,
    /// Avatar URL, if the user has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

impl UserProfile {
    /// Creates a profile without an avatar.
    pub fn named(id: UserId, full_name: impl Into<String>) -> Self {
        Self {
            id,
            full_name: full_name.into(),
            profile_pic: None,
        }
    }
}

/// `GET /api/messages/users`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsersResponse {
    /// Always `true` for this body.
    pub success: bool,
    /// Everyone except the caller.
    pub users: Vec<UserProfile>,
    /// Unseen message counts by sender; senders with zero are omitted.
    pub unseen_messages: HashMap<UserId, usize>,
}

/// `GET /api/messages/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Always `true` for this body.
    pub success: bool,
    /// The conversation in creation order.
    pub messages: Vec<ChatMessage>,
}

/// `POST /api/messages/send/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// Always `true` for this body.
    pub success: bool,
    /// The persisted message.
    pub new_message: ChatMessage,
}

/// Bare success/failure body, used by `PUT /api/messages/mark/{id}` and
/// by every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Whether the request succeeded.
    pub success: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckResponse {
    /// A successful acknowledgment.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    /// A failure with `reason`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(reason.into()),
        }
    }
}
