// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::match_same_arms,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! End-to-end chat tests: two clients driven through `spawn_net` against an
//! in-process relay.
//!
//! Verifies:
//! 1. A message sent in an open conversation shows up live on the other
//!    side exactly once, and the sender learns it was read.
//! 2. A message for a closed conversation raises the unseen counter; opening
//!    the conversation loads it and sends a read receipt back.
//! 3. Messages sent while the partner is offline are served on their next
//!    fetch.
//! 4. Send errors are reported without stopping the session.
//! 5. Shutting down closes the socket before the event channel ends.

use std::time::Duration;

use duochat::net::{self, NetCommand, NetConfig, NetEvent};
use duochat_proto::message::{ChatMessage, NewMessage, UserId};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Start relay on port 0 (OS-assigned), return (base url, handle).
async fn start_relay() -> (String, tokio::task::JoinHandle<()>) {
    let (addr, handle) = duochat_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    (format!("http://{addr}"), handle)
}

struct Client {
    commands: mpsc::Sender<NetCommand>,
    events: mpsc::Receiver<NetEvent>,
}

async fn sign_in(url: &str, user: &str, partner: Option<&str>) -> Client {
    let mut config = NetConfig::new(url.to_string(), UserId::new(user));
    config.partner = partner.map(UserId::new);
    let (commands, events) = net::spawn_net(config).await.expect("sign-in failed");
    Client { commands, events }
}

/// Wait for an event matching `pred`, skipping others. Panics on timeout.
async fn wait_for<F>(client: &mut Client, description: &str, pred: F) -> NetEvent
where
    F: Fn(&NetEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, client.events.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_)) => {}
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

/// Collect every event that arrives within `window`.
async fn drain(client: &mut Client, window: Duration) -> Vec<NetEvent> {
    let mut out = Vec::new();
    while let Ok(Some(evt)) = tokio::time::timeout(window, client.events.recv()).await {
        out.push(evt);
    }
    out
}

async fn wait_for_loaded(client: &mut Client, partner: &str) -> Vec<ChatMessage> {
    let partner = UserId::new(partner);
    match wait_for(client, "ConversationLoaded", |e| {
        matches!(e, NetEvent::ConversationLoaded { partner: p, .. } if *p == partner)
    })
    .await
    {
        NetEvent::ConversationLoaded { messages, .. } => messages,
        _ => unreachable!(),
    }
}

async fn wait_for_roster_with(client: &mut Client, user: &str) {
    let user = UserId::new(user);
    wait_for(client, "roster update", |e| {
        matches!(e, NetEvent::RosterUpdated(r) if r.contains(&user))
    })
    .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_message_in_open_conversation() {
    let (url, _handle) = start_relay().await;
    let mut alice = sign_in(&url, "alice", Some("bob")).await;
    wait_for_loaded(&mut alice, "bob").await;
    let mut bob = sign_in(&url, "bob", Some("alice")).await;
    wait_for_loaded(&mut bob, "alice").await;
    wait_for_roster_with(&mut alice, "bob").await;

    alice
        .commands
        .send(NetCommand::Send(NewMessage::text("hi bob")))
        .await
        .unwrap();

    let sent = match wait_for(&mut alice, "MessageSent", |e| {
        matches!(e, NetEvent::MessageSent(_))
    })
    .await
    {
        NetEvent::MessageSent(msg) => msg,
        _ => unreachable!(),
    };
    assert_eq!(sent.sender_id, UserId::new("alice"));
    assert_eq!(sent.text.as_deref(), Some("hi bob"));

    let received = match wait_for(&mut bob, "MessageReceived", |e| {
        matches!(e, NetEvent::MessageReceived(_))
    })
    .await
    {
        NetEvent::MessageReceived(msg) => msg,
        _ => unreachable!(),
    };
    assert_eq!(received.id, sent.id);
    assert!(received.seen);

    // Bob's client read it, so alice gets a receipt for that message.
    let seen = wait_for(&mut alice, "MessageSeen", |e| {
        matches!(e, NetEvent::MessageSeen(_))
    })
    .await;
    assert_eq!(seen, NetEvent::MessageSeen(sent.id));

    // The relayed copy of the same message is not shown twice.
    let rest = drain(&mut bob, Duration::from_millis(500)).await;
    assert!(
        !rest
            .iter()
            .any(|e| matches!(e, NetEvent::MessageReceived(m) if m.id == sent.id)),
        "duplicate delivery: {rest:?}"
    );
}

#[tokio::test]
async fn message_for_closed_conversation_counts_unseen() {
    let (url, _handle) = start_relay().await;
    let mut alice = sign_in(&url, "alice", Some("bob")).await;
    wait_for_loaded(&mut alice, "bob").await;
    let mut bob = sign_in(&url, "bob", None).await;
    wait_for_roster_with(&mut alice, "bob").await;

    alice
        .commands
        .send(NetCommand::Send(NewMessage::text("are you there?")))
        .await
        .unwrap();

    let unseen = wait_for(&mut bob, "Unseen", |e| matches!(e, NetEvent::Unseen { .. })).await;
    assert_eq!(
        unseen,
        NetEvent::Unseen {
            from: UserId::new("alice"),
            count: 1
        }
    );
    let alice_id = UserId::new("alice");
    wait_for(&mut bob, "UsersUpdated with unseen", |e| {
        matches!(e, NetEvent::UsersUpdated { unseen, .. } if unseen.get(&alice_id) == Some(&1))
    })
    .await;

    // Opening the conversation loads the message and tells alice.
    bob.commands
        .send(NetCommand::Select(UserId::new("alice")))
        .await
        .unwrap();
    let history = wait_for_loaded(&mut bob, "alice").await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].seen);

    let bob_id = UserId::new("bob");
    wait_for(&mut alice, "ConversationSeen", |e| {
        matches!(e, NetEvent::ConversationSeen { by } if *by == bob_id)
    })
    .await;

    bob.commands.send(NetCommand::RefreshUsers).await.unwrap();
    let refreshed = wait_for(&mut bob, "cleared unseen", |e| {
        matches!(e, NetEvent::UsersUpdated { unseen, .. } if unseen.is_empty())
    })
    .await;
    // Alice's socket is still open, so her sidebar entry shows her online.
    match refreshed {
        NetEvent::UsersUpdated { statuses, .. } => {
            assert!(statuses.get(&alice_id).is_some_and(|s| s.online && s.last_seen.is_some()));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn offline_partner_reads_history_on_next_fetch() {
    let (url, _handle) = start_relay().await;
    let mut alice = sign_in(&url, "alice", Some("bob")).await;
    wait_for_loaded(&mut alice, "bob").await;

    for text in ["first", "second"] {
        alice
            .commands
            .send(NetCommand::Send(NewMessage::text(text)))
            .await
            .unwrap();
        wait_for(&mut alice, "MessageSent", |e| matches!(e, NetEvent::MessageSent(_))).await;
    }

    let mut bob = sign_in(&url, "bob", Some("alice")).await;
    let history = wait_for_loaded(&mut bob, "alice").await;
    let texts: Vec<_> = history.iter().filter_map(|m| m.text.as_deref()).collect();
    assert_eq!(texts, vec!["first", "second"]);
}

#[tokio::test]
async fn send_errors_do_not_end_the_session() {
    let (url, _handle) = start_relay().await;
    let mut alice = sign_in(&url, "alice", None).await;

    // Nothing selected yet.
    alice
        .commands
        .send(NetCommand::Send(NewMessage::text("lost")))
        .await
        .unwrap();
    wait_for(&mut alice, "no selection error", |e| matches!(e, NetEvent::Error(_))).await;

    alice
        .commands
        .send(NetCommand::Select(UserId::new("bob")))
        .await
        .unwrap();
    wait_for_loaded(&mut alice, "bob").await;

    // An empty body is rejected by the server.
    alice
        .commands
        .send(NetCommand::Send(NewMessage::default()))
        .await
        .unwrap();
    wait_for(&mut alice, "rejected send", |e| matches!(e, NetEvent::Error(_))).await;

    alice
        .commands
        .send(NetCommand::Send(NewMessage::image("https://img.example/cat.png")))
        .await
        .unwrap();
    let sent = wait_for(&mut alice, "MessageSent", |e| matches!(e, NetEvent::MessageSent(_))).await;
    assert!(matches!(sent, NetEvent::MessageSent(m) if m.image.is_some() && m.text.is_none()));

    alice.commands.send(NetCommand::Shutdown).await.unwrap();
    let rest = drain(&mut alice, Duration::from_secs(2)).await;
    assert!(rest.iter().all(|e| !matches!(e, NetEvent::MessageSent(_))));
    assert!(alice.events.recv().await.is_none());
}

#[tokio::test]
async fn shutdown_closes_socket_before_events_end() {
    let state = std::sync::Arc::new(duochat_relay::relay::RelayState::new());
    let (addr, _handle) =
        duochat_relay::relay::start_server_with_state("127.0.0.1:0", std::sync::Arc::clone(&state))
            .await
            .expect("failed to start relay server");
    let mut alice = sign_in(&format!("http://{addr}"), "alice", None).await;
    wait_for_roster_with(&mut alice, "alice").await;
    let alice_id = UserId::new("alice");
    assert!(state.presence.sender_for(&alice_id).await.is_some());

    alice.commands.send(NetCommand::Shutdown).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while alice.events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "event channel stayed open after shutdown");

    // The close frame was sent before the channel ended.
    let mut released = false;
    for _ in 0..50 {
        if state.presence.sender_for(&alice_id).await.is_none() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "relay still routes to a shut-down client");
}
