//! HTTP client for the message API.
//!
//! Every request carries the caller's identity in the `x-user-id` header.
//! Error bodies are `{"success": false, "message": ...}`; their message is
//! surfaced as [`ApiError::Rejected`].

use std::time::Duration;

use duochat_proto::api::{
    AckResponse, MessagesResponse, SendResponse, USER_HEADER, UsersResponse,
};
use duochat_proto::message::{ChatMessage, MessageId, NewMessage, UserId};
use serde::de::DeserializeOwned;
use url::Url;

/// Default per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors returned by [`ApiClient`].
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server base URL cannot carry API paths.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The request failed before a response arrived, or the body was not
    /// the expected JSON.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a failure.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Message API client bound to one user.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    user: UserId,
}

impl ApiClient {
    /// Creates a client for `server_url` acting as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if `server_url` is not an absolute
    /// HTTP(S) URL, or [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(server_url: &str, user: UserId) -> Result<Self, ApiError> {
        let base = Url::parse(server_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{server_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ApiError::InvalidUrl(format!(
                "{server_url}: expected http or https"
            )));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base, user })
    }

    /// `GET /api/status`: the server's liveness string.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a non-success status.
    pub async fn status(&self) -> Result<String, ApiError> {
        let response = self.http.get(self.endpoint(&["api", "status"])?).send().await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.text().await?)
    }

    /// `GET /api/messages/users`: everyone else plus unseen counts.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a rejected request.
    pub async fn users(&self) -> Result<UsersResponse, ApiError> {
        let url = self.endpoint(&["api", "messages", "users"])?;
        read(self.http.get(url).header(USER_HEADER, self.user.as_str()).send().await?).await
    }

    /// `GET /api/messages/{partner}`: the conversation, oldest first.
    ///
    /// The server marks the partner's messages to us as seen.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a rejected request.
    pub async fn messages(&self, partner: &UserId) -> Result<Vec<ChatMessage>, ApiError> {
        let url = self.endpoint(&["api", "messages", partner.as_str()])?;
        let body: MessagesResponse =
            read(self.http.get(url).header(USER_HEADER, self.user.as_str()).send().await?).await?;
        Ok(body.messages)
    }

    /// `POST /api/messages/send/{partner}`: persists a message.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Rejected`] for empty or oversized bodies.
    pub async fn send(&self, partner: &UserId, body: &NewMessage) -> Result<ChatMessage, ApiError> {
        let url = self.endpoint(&["api", "messages", "send", partner.as_str()])?;
        let response = self
            .http
            .post(url)
            .header(USER_HEADER, self.user.as_str())
            .json(body)
            .send()
            .await?;
        let body: SendResponse = read(response).await?;
        Ok(body.new_message)
    }

    /// `PUT /api/messages/mark/{id}`: marks one incoming message seen.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Rejected`] if the message is unknown or was not
    /// addressed to this user.
    pub async fn mark_seen(&self, id: MessageId) -> Result<(), ApiError> {
        let id = id.to_string();
        let url = self.endpoint(&["api", "messages", "mark", &id])?;
        let ack: AckResponse =
            read(self.http.put(url).header(USER_HEADER, self.user.as_str()).send().await?).await?;
        if ack.success {
            Ok(())
        } else {
            Err(ApiError::Rejected(ack.message.unwrap_or_default()))
        }
    }

    /// Builds an endpoint URL, percent-encoding each path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Decodes a success body or turns a failure into [`ApiError::Rejected`].
async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(rejection(response).await)
    }
}

async fn rejection(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let message = match response.json::<AckResponse>().await {
        Ok(AckResponse {
            message: Some(message),
            ..
        }) => message,
        _ => status.to_string(),
    };
    tracing::debug!(status = %status, message = %message, "request rejected");
    ApiError::Rejected(message)
}
