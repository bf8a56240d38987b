//! WebSocket transport to the relay server.
//!
//! [`SocketTransport`] holds one socket registered under the local user.
//! Outgoing [`ClientEvent`]s are written as JSON text frames; a background
//! reader task decodes incoming frames into [`ServerEvent`]s and queues them
//! for [`SocketTransport::recv`]. Malformed frames are logged and skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duochat_proto::codec::{self, CodecError};
use duochat_proto::event::{ClientEvent, ServerEvent};
use duochat_proto::message::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the decoded-event queue.
const INCOMING_CAPACITY: usize = 256;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The socket has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server URL cannot be turned into a socket URL.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// Nothing is listening at the server address.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// An outgoing event could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An underlying I/O or protocol error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Derives the socket URL (`ws[s]://host/ws?userId=<user>`) from the
/// server's HTTP base URL.
///
/// `http` maps to `ws` and `https` to `wss`; socket schemes are kept.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] if the URL does not parse or uses
/// another scheme.
pub fn socket_url(server_url: &str, user: &UserId) -> Result<Url, TransportError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| TransportError::InvalidUrl(format!("{server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "{server_url}: unsupported scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(format!("{server_url}: cannot use {scheme}")))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut().append_pair("userId", user.as_str());
    Ok(url)
}

/// A live socket to the relay, registered under one user.
pub struct SocketTransport {
    /// The user this socket is registered as.
    user: UserId,
    /// The socket URL in use.
    url: Url,
    /// Write half of the socket.
    ws_sender: Mutex<WsSender>,
    /// Events decoded by the reader task.
    incoming: Mutex<mpsc::Receiver<ServerEvent>>,
    /// Cleared when the reader task exits or a write fails.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("user", &self.user)
            .field("url", &self.url.as_str())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SocketTransport {
    /// Opens a socket for `user` using the default [`CONNECT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// See [`SocketTransport::connect_with_timeout`].
    pub async fn connect(server_url: &str, user: UserId) -> Result<Self, TransportError> {
        Self::connect_with_timeout(server_url, user, CONNECT_TIMEOUT).await
    }

    /// Opens a socket for `user` and spawns the reader task.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidUrl`] if `server_url` is unusable.
    /// - [`TransportError::Timeout`] if the handshake takes longer than `timeout`.
    /// - [`TransportError::Unreachable`] if the connection is refused.
    /// - [`TransportError::Io`] for TLS or HTTP upgrade failures.
    pub async fn connect_with_timeout(
        server_url: &str,
        user: UserId,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = socket_url(server_url, &user)?;

        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!(url = %url, "socket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = %url, err = %e, "socket connect failed");
                map_ws_connect_error(e, &url)
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(user_id = %user, url = %url, "socket connected");

        Ok(Self {
            user,
            url,
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// Sends one event as a text frame.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionClosed`] if the socket is down.
    /// - [`TransportError::Codec`] if the event cannot be encoded.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode_client(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "socket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    /// Waits for the next event from the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the reader task has
    /// exited and every queued event has been drained.
    pub async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    /// Whether the socket is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends a close frame. The reader task exits once the server answers.
    pub async fn close(&self) {
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not sent");
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that decodes incoming frames.
///
/// tungstenite queues the pong for every server ping and flushes it while
/// this loop reads, so pings need no handling here.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match codec::decode_server(text.as_str()) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        // Transport dropped.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed server event, skipping");
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "socket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "socket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("socket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error, url: &Url) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.host_str().unwrap_or("server").to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "socket upgrade rejected: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "socket connection error: {other}"
        ))),
    }
}
