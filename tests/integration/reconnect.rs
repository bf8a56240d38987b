// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for socket reconnects.
//!
//! Tests that the `net` supervisor notices a dropped socket, backs off,
//! reconnects, and reloads what it missed; that it gives up after the
//! configured number of attempts; and that two sessions of one user do not
//! push each other off the relay.
//!
//! ## Disconnect simulation
//!
//! A **TCP proxy** sits between the client and the real relay. Killing it
//! aborts every proxied connection task, which drops both TCP streams and
//! makes the client's socket fail. Restarting the proxy on the same port
//! lets the reconnect succeed.

use std::sync::Arc;
use std::time::Duration;

use duochat::config::ReconnectConfig;
use duochat::net::{self, NetCommand, NetConfig, NetEvent};
use duochat_proto::message::{NewMessage, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the relay. `kill()` severs everything.
struct TcpProxy {
    /// Address clients should connect to (127.0.0.1:<proxy_port>).
    client_addr: String,
    accept_handle: tokio::task::JoinHandle<()>,
    /// All per-connection task handles. Aborting these kills the TCP streams.
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Create a new TCP proxy from `proxy_port` (0 for any) to `backend_addr`.
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let client_addr = listener.local_addr().unwrap().to_string();
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so aborting this task drops both streams.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            client_addr,
            accept_handle,
            conn_handles,
        }
    }

    fn port(&self) -> u16 {
        self.client_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap()
    }

    /// Kill the proxy, severing all connections immediately.
    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn start_relay() -> (String, tokio::task::JoinHandle<()>) {
    let (addr, handle) = duochat_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    (addr.to_string(), handle)
}

fn fast_reconnect(url: &str, user: &str, max_attempts: u32) -> NetConfig {
    let mut config = NetConfig::new(url.to_string(), UserId::new(user));
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(400),
        multiplier: 2,
        max_attempts,
    };
    config.connect_timeout = Duration::from_secs(2);
    config
}

/// Wait for an event matching `pred`, skipping others. Panics on timeout.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<NetEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> NetEvent
where
    F: Fn(&NetEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn reconnects_after_socket_loss_and_resyncs() {
    let (relay_addr, _relay) = start_relay().await;
    let proxy = TcpProxy::new(0, &relay_addr).await;
    let proxy_port = proxy.port();

    let mut config = fast_reconnect(&format!("http://{}", proxy.client_addr), "alice", 0);
    config.partner = Some(UserId::new("bob"));
    let (cmd_tx, mut evt_rx) = net::spawn_net(config).await.unwrap();
    wait_for_event(&mut evt_rx, Duration::from_secs(5), "initial load", |e| {
        matches!(e, NetEvent::ConversationLoaded { .. })
    })
    .await;

    proxy.kill();
    wait_for_event(&mut evt_rx, Duration::from_secs(5), "disconnect", |e| {
        matches!(e, NetEvent::ConnectionStatus { connected: false })
    })
    .await;
    let first = wait_for_event(&mut evt_rx, Duration::from_secs(5), "backoff", |e| {
        matches!(e, NetEvent::Reconnecting { .. })
    })
    .await;
    assert_eq!(
        first,
        NetEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(100)
        }
    );

    // Bob writes while alice's socket is down; he talks to the relay directly.
    let bob = duochat::api::ApiClient::new(&format!("http://{relay_addr}"), UserId::new("bob"))
        .unwrap();
    let missed = bob
        .send(&UserId::new("alice"), &NewMessage::text("while you were away"))
        .await
        .unwrap();

    let proxy = TcpProxy::new(proxy_port, &relay_addr).await;
    wait_for_event(&mut evt_rx, Duration::from_secs(10), "reconnect", |e| {
        matches!(e, NetEvent::ConnectionStatus { connected: true })
    })
    .await;

    // The open conversation is reloaded and includes the missed message.
    let reloaded = wait_for_event(&mut evt_rx, Duration::from_secs(5), "resync", |e| {
        matches!(e, NetEvent::ConversationLoaded { .. })
    })
    .await;
    match reloaded {
        NetEvent::ConversationLoaded { partner, messages } => {
            assert_eq!(partner, UserId::new("bob"));
            assert!(messages.iter().any(|m| m.id == missed.id));
        }
        _ => unreachable!(),
    }

    cmd_tx.send(NetCommand::Shutdown).await.unwrap();
    proxy.kill();
}

#[tokio::test]
async fn backoff_delays_grow_until_capped() {
    let (relay_addr, _relay) = start_relay().await;
    let proxy = TcpProxy::new(0, &relay_addr).await;

    let config = fast_reconnect(&format!("http://{}", proxy.client_addr), "alice", 0);
    let (cmd_tx, mut evt_rx) = net::spawn_net(config).await.unwrap();
    proxy.kill();

    let mut delays = Vec::new();
    while delays.len() < 4 {
        if let NetEvent::Reconnecting { attempt, delay } =
            wait_for_event(&mut evt_rx, Duration::from_secs(10), "backoff", |e| {
                matches!(e, NetEvent::Reconnecting { .. })
            })
            .await
        {
            assert_eq!(attempt as usize, delays.len() + 1);
            delays.push(delay.as_millis());
        }
    }
    assert_eq!(delays, vec![100, 200, 400, 400]);

    cmd_tx.send(NetCommand::Shutdown).await.unwrap();
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let (relay_addr, _relay) = start_relay().await;
    let proxy = TcpProxy::new(0, &relay_addr).await;

    let config = fast_reconnect(&format!("http://{}", proxy.client_addr), "alice", 2);
    let (_cmd_tx, mut evt_rx) = net::spawn_net(config).await.unwrap();
    proxy.kill();

    let gave_up = wait_for_event(&mut evt_rx, Duration::from_secs(10), "give up", |e| {
        matches!(e, NetEvent::Error(msg) if msg.contains("could not reconnect"))
    })
    .await;
    assert!(matches!(gave_up, NetEvent::Error(msg) if msg.contains("2 attempts")));

    // The supervisor stopped, so the event channel closes.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while evt_rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn commands_work_while_socket_is_down() {
    let state = Arc::new(duochat_relay::relay::RelayState::new());
    let (relay_addr, _relay) =
        duochat_relay::relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .expect("failed to start relay server");

    let mut config = fast_reconnect(&format!("http://{relay_addr}"), "alice", 0);
    config.partner = Some(UserId::new("bob"));
    // Keep the socket down long enough to exercise the HTTP path.
    config.reconnect.initial_delay = Duration::from_secs(30);
    config.reconnect.max_delay = Duration::from_secs(30);
    let (cmd_tx, mut evt_rx) = net::spawn_net(config).await.unwrap();
    wait_for_event(&mut evt_rx, Duration::from_secs(5), "initial load", |e| {
        matches!(e, NetEvent::ConversationLoaded { .. })
    })
    .await;

    state.presence.close_all().await;
    wait_for_event(&mut evt_rx, Duration::from_secs(5), "disconnect", |e| {
        matches!(e, NetEvent::ConnectionStatus { connected: false })
    })
    .await;

    cmd_tx
        .send(NetCommand::Send(NewMessage::text("still here")))
        .await
        .unwrap();
    let sent = wait_for_event(&mut evt_rx, Duration::from_secs(5), "MessageSent", |e| {
        matches!(e, NetEvent::MessageSent(_))
    })
    .await;
    assert!(matches!(sent, NetEvent::MessageSent(m) if m.text.as_deref() == Some("still here")));
    assert_eq!(
        state
            .store
            .conversation(&UserId::new("alice"), &UserId::new("bob"))
            .await
            .len(),
        1
    );

    cmd_tx.send(NetCommand::Shutdown).await.unwrap();
}

#[tokio::test]
async fn two_sessions_for_one_user_stay_connected() {
    let (relay_addr, _relay) = start_relay().await;
    let url = format!("http://{relay_addr}");

    let (first_tx, mut first_rx) = net::spawn_net(fast_reconnect(&url, "alice", 0))
        .await
        .unwrap();
    let (second_tx, mut second_rx) = net::spawn_net(fast_reconnect(&url, "alice", 0))
        .await
        .unwrap();

    // Count drops on both sessions over several backoff periods.
    let window = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut drops = 0;
    loop {
        tokio::select! {
            evt = first_rx.recv() => {
                if matches!(evt, Some(NetEvent::ConnectionStatus { connected: false })) {
                    drops += 1;
                }
            }
            evt = second_rx.recv() => {
                if matches!(evt, Some(NetEvent::ConnectionStatus { connected: false })) {
                    drops += 1;
                }
            }
            () = tokio::time::sleep_until(window) => break,
        }
    }
    assert_eq!(drops, 0, "sessions knocked each other offline {drops} times");

    first_tx.send(NetCommand::Shutdown).await.unwrap();
    second_tx.send(NetCommand::Shutdown).await.unwrap();
}
