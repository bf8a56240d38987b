//! Message HTTP API.
//!
//! These endpoints persist and fetch messages and then call into the
//! presence layer to push live events to whichever participant has an
//! active socket.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use duochat_proto::api::{
    AckResponse, MessagesResponse, SendResponse, USER_HEADER, UsersResponse,
};
use duochat_proto::event::ServerEvent;
use duochat_proto::message::{MessageId, NewMessage, UserId, ValidationError};

use crate::relay::RelayState;

/// Errors returned by the message API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No identity header on the request.
    #[error("not authorized: missing x-user-id header")]
    Unauthorized,

    /// Path segment is not a message id.
    #[error("invalid message id: {0}")]
    InvalidId(String),

    /// No message with this id is stored.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// Caller is not the recipient of the message.
    #[error("only the recipient can mark a message as seen")]
    Forbidden,

    /// Message body failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidId(_) | Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(AckResponse::failed(self.to_string()))).into_response()
    }
}

/// The caller's identity, asserted by the upstream auth layer.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(UserId::new(v)))
            .ok_or(ApiError::Unauthorized)
    }
}

/// Routes of the message API, limited to `max_body` bytes per request.
pub fn routes(max_body: usize) -> Router<Arc<RelayState>> {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/messages/users", get(users_for_sidebar))
        .route("/api/messages/{id}", get(messages))
        .route("/api/messages/mark/{id}", put(mark_seen))
        .route("/api/messages/send/{id}", post(send_message))
        .layer(DefaultBodyLimit::max(max_body))
}

async fn status() -> &'static str {
    "Server is live"
}

/// Everyone except the caller, with unseen counts per sender.
async fn users_for_sidebar(
    State(state): State<Arc<RelayState>>,
    AuthUser(me): AuthUser,
) -> Json<UsersResponse> {
    state.users.touch(&me).await;
    let users = state.users.others(&me).await;
    let unseen_messages = state.store.unseen_counts(&me).await;
    Json(UsersResponse {
        success: true,
        users,
        unseen_messages,
    })
}

/// Returns the conversation with `partner`, then marks their messages seen.
///
/// The response carries the flags as they were before this read.
async fn messages(
    State(state): State<Arc<RelayState>>,
    AuthUser(me): AuthUser,
    Path(partner): Path<String>,
) -> Json<MessagesResponse> {
    let partner = UserId::new(partner);
    state.users.touch(&me).await;

    let messages = state.store.conversation(&me, &partner).await;
    let marked = state.store.mark_conversation_seen(&me, &partner).await;
    tracing::debug!(
        user_id = %me,
        partner = %partner,
        count = messages.len(),
        marked,
        "conversation fetched"
    );

    if marked > 0 {
        let notified = state
            .presence
            .send_event(&partner, &ServerEvent::MessagesSeen { by: me.clone() })
            .await;
        tracing::debug!(to = %partner, notified, "messagesSeen emitted");
    }

    Json(MessagesResponse {
        success: true,
        messages,
    })
}

/// Marks a single message seen and tells its sender.
async fn mark_seen(
    State(state): State<Arc<RelayState>>,
    AuthUser(me): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    let id: MessageId = id.parse().map_err(|_| ApiError::InvalidId(id.clone()))?;
    let existing = state.store.get(id).await.ok_or(ApiError::NotFound(id))?;
    if existing.receiver_id != me {
        return Err(ApiError::Forbidden);
    }
    let updated = state.store.mark_seen(id).await.ok_or(ApiError::NotFound(id))?;

    let notified = state
        .presence
        .send_event(&updated.sender_id, &ServerEvent::MessageSeen { message_id: id })
        .await;
    tracing::debug!(message_id = %id, to = %updated.sender_id, notified, "messageSeen emitted");

    Ok(Json(AckResponse::ok()))
}

/// Persists a message and pushes it to both participants' sockets.
async fn send_message(
    State(state): State<Arc<RelayState>>,
    AuthUser(me): AuthUser,
    Path(receiver): Path<String>,
    Json(body): Json<NewMessage>,
) -> Result<Json<SendResponse>, ApiError> {
    body.validate(state.settings.max_payload_size)?;
    let receiver = UserId::new(receiver);
    state.users.touch(&me).await;

    let message = state.store.insert(&me, &receiver, body).await;
    tracing::info!(from = %me, to = %receiver, message_id = %message.id, "message stored");

    let event = ServerEvent::NewMessage(message.clone());
    if state.presence.send_event(&receiver, &event).await {
        tracing::debug!(to = %receiver, "message pushed live");
    } else {
        tracing::debug!(to = %receiver, "receiver offline, left for next fetch");
    }
    // Echo to the sender's own socket so other views of the chat update.
    if receiver != me {
        state.presence.send_event(&me, &event).await;
    }

    Ok(Json(SendResponse {
        success: true,
        new_message: message,
    }))
}
