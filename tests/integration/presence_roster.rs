// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the online roster.
//!
//! Verifies, over real sockets against an in-process relay:
//! 1. Everyone on the roster learns when a user connects.
//! 2. A user who drops and comes back within the grace period never
//!    leaves the roster.
//! 3. Once the grace period runs out the departure is announced.
//! 4. A user who opens a second socket stays on the roster once, and the
//!    first socket is not cut off.

use std::sync::Arc;
use std::time::Duration;

use duochat::transport::SocketTransport;
use duochat_proto::event::{ClientEvent, ServerEvent};
use duochat_proto::message::UserId;
use duochat_relay::relay::{self, RelaySettings, RelayState};
use duochat_relay::store::MessageStore;
use duochat_relay::users::UserDirectory;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Start a relay with the given grace period and no background timers.
async fn start_relay(grace_period: Duration) -> (String, Arc<RelayState>) {
    let settings = RelaySettings {
        grace_period,
        roster_interval: None,
        ping_interval: None,
        idle_timeout: None,
        ..RelaySettings::default()
    };
    let state = Arc::new(RelayState::with_settings(
        settings,
        MessageStore::new(),
        UserDirectory::new(),
    ));
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start relay server");
    (format!("http://{addr}"), state)
}

async fn connect(url: &str, user: &str) -> SocketTransport {
    SocketTransport::connect(url, UserId::new(user))
        .await
        .expect("socket connect failed")
}

fn ids(names: &[&str]) -> Vec<UserId> {
    names.iter().map(|n| UserId::new(*n)).collect()
}

/// Wait for the next roster event, skipping anything else.
async fn next_roster(transport: &SocketTransport, timeout: Duration) -> Option<Vec<UserId>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, transport.recv()).await {
            Ok(Ok(ServerEvent::OnlineUsers(roster))) => return Some(roster),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("socket closed while waiting for roster: {e}"),
            Err(_) => return None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arrivals_are_announced_to_everyone() {
    let (url, _state) = start_relay(Duration::ZERO).await;

    let alice = connect(&url, "alice").await;
    assert_eq!(
        next_roster(&alice, Duration::from_secs(5)).await,
        Some(ids(&["alice"]))
    );

    let bob = connect(&url, "bob").await;
    assert_eq!(
        next_roster(&bob, Duration::from_secs(5)).await,
        Some(ids(&["alice", "bob"]))
    );
    assert_eq!(
        next_roster(&alice, Duration::from_secs(5)).await,
        Some(ids(&["alice", "bob"]))
    );
}

#[tokio::test]
async fn departure_without_grace_is_announced() {
    let (url, state) = start_relay(Duration::ZERO).await;

    let alice = connect(&url, "alice").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;
    let bob = connect(&url, "bob").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;

    bob.close().await;
    drop(bob);

    assert_eq!(
        next_roster(&alice, Duration::from_secs(5)).await,
        Some(ids(&["alice"]))
    );
    assert!(!state.presence.is_online(&UserId::new("bob")).await);
}

#[tokio::test]
async fn quick_reconnect_keeps_user_on_roster() {
    let (url, state) = start_relay(Duration::from_secs(3)).await;

    let alice = connect(&url, "alice").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;
    let bob = connect(&url, "bob").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;

    // Simulate a page refresh: the old socket drops, a new one follows.
    drop(bob);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.presence.is_online(&UserId::new("bob")).await);

    let bob = connect(&url, "bob").await;
    // The returning socket gets the roster; membership never changed.
    assert_eq!(
        next_roster(&bob, Duration::from_secs(5)).await,
        Some(ids(&["alice", "bob"]))
    );
    assert_eq!(next_roster(&alice, Duration::from_millis(500)).await, None);

    // Once the grace period of the old socket would have ended, bob is
    // still online.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(state.presence.is_online(&UserId::new("bob")).await);
    assert_eq!(next_roster(&alice, Duration::from_millis(200)).await, None);
}

#[tokio::test]
async fn grace_expiry_announces_departure() {
    let (url, _state) = start_relay(Duration::from_millis(300)).await;

    let alice = connect(&url, "alice").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;
    let bob = connect(&url, "bob").await;
    let _ = next_roster(&alice, Duration::from_secs(5)).await;

    drop(bob);

    assert_eq!(
        next_roster(&alice, Duration::from_secs(5)).await,
        Some(ids(&["alice"]))
    );
}

#[tokio::test]
async fn second_socket_keeps_single_roster_entry() {
    let (url, state) = start_relay(Duration::ZERO).await;

    let first = connect(&url, "alice").await;
    let _ = next_roster(&first, Duration::from_secs(5)).await;
    let second = connect(&url, "alice").await;

    assert_eq!(
        next_roster(&second, Duration::from_secs(5)).await,
        Some(ids(&["alice"]))
    );
    assert_eq!(state.presence.len().await, 1);

    // The older socket is left open.
    first.send(&ClientEvent::Ping).await.unwrap();
    let answered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.recv().await {
                Ok(ServerEvent::Pong) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;
    assert_eq!(answered.ok(), Some(true), "older socket was cut off");
    assert!(first.is_connected());

    first.close().await;
    drop(first);

    // Closing the replaced socket does not take alice offline.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(state.presence.is_online(&UserId::new("alice")).await);
    second.send(&ClientEvent::GetOnlineUsers).await.unwrap();
    assert_eq!(
        next_roster(&second, Duration::from_secs(5)).await,
        Some(ids(&["alice"]))
    );
}
