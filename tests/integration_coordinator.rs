//! End-to-end tests: coordinators talking to a real coordination server
//!
//! Covers the full flow: handshake → presence → editing intent → change fan-out,
//! plus reconnection against a scripted endpoint.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message as WsMessage};

use collab_coordinator::protocol::EntityChange;
use collab_coordinator::{ConnectionState, Coordinator, CoordinatorEvent, Identity, ServerHandle};

use common::{connect_user, next_matching, session_config, start_server, wait_until, WAIT};

/// Keep publishing until the context has members
async fn publish_when_joined(handle: &ServerHandle, context: &str, change: EntityChange) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !handle.publish_change(Some(context), change.clone()).await {
        assert!(tokio::time::Instant::now() < deadline, "context {context} never had members");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Presence and Editing Intent
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_editing_intent_reaches_peer() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (bob, _bob_events) = connect_user(addr, "bob", Some("v3")).await;

    assert!(wait_until(|| alice.presence_list().iter().any(|p| p.user_id == "bob")).await);

    bob.start_editing("parcel", "P9");

    assert!(wait_until(|| alice.is_being_edited("parcel", "P9")).await);
    let editor = alice.get_editor("parcel", "P9").expect("editor");
    assert_eq!(editor.user_id, "bob");
    assert_eq!(editor.display_name, "bob (test)");

    // Own intent never shows up as a remote editor
    assert!(!bob.is_being_edited("parcel", "P9"));
    assert_eq!(
        bob.editing_intent().map(|t| t.to_string()).as_deref(),
        Some("parcel/P9")
    );

    bob.stop_editing();
    assert!(wait_until(|| !alice.is_being_edited("parcel", "P9")).await);
    assert!(alice.get_editor("parcel", "P9").is_none());
}

#[tokio::test]
async fn test_own_intent_does_not_hide_peer_on_same_target() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (bob, _bob_events) = connect_user(addr, "bob", Some("v3")).await;
    assert!(wait_until(|| alice.presence_list().iter().any(|p| p.user_id == "bob")).await);

    alice.start_editing("parcel", "P9");
    assert!(wait_until(|| bob.is_being_edited("parcel", "P9")).await);

    bob.start_editing("parcel", "P9");
    assert!(wait_until(|| alice.is_being_edited("parcel", "P9")).await);
    let editor = alice.get_editor("parcel", "P9").expect("editor");
    assert_eq!(editor.user_id, "bob");

    // Both sides see the other, never themselves
    let editor = bob.get_editor("parcel", "P9").expect("editor");
    assert_eq!(editor.user_id, "alice");
    assert_eq!(
        alice.editing_intent().map(|t| t.to_string()).as_deref(),
        Some("parcel/P9")
    );
}

#[tokio::test]
async fn test_switching_intent_replaces_previous_target() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (bob, _bob_events) = connect_user(addr, "bob", Some("v3")).await;
    assert!(wait_until(|| alice.presence_list().iter().any(|p| p.user_id == "bob")).await);

    bob.start_editing("parcel", "P9");
    assert!(wait_until(|| alice.is_being_edited("parcel", "P9")).await);

    bob.start_editing("task", "T1");
    assert!(wait_until(|| alice.is_being_edited("task", "T1")).await);
    assert!(!alice.is_being_edited("parcel", "P9"));
}

#[tokio::test]
async fn test_peer_departure_clears_presence() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (mut bob, _bob_events) = connect_user(addr, "bob", Some("v3")).await;

    bob.start_editing("parcel", "P9");
    assert!(wait_until(|| alice.is_being_edited("parcel", "P9")).await);

    bob.shutdown().await;
    assert_eq!(bob.connection_state(), ConnectionState::Disconnected);

    assert!(wait_until(|| alice.presence_list().is_empty()).await);
    assert!(!alice.is_being_edited("parcel", "P9"));
}

#[tokio::test]
async fn test_contexts_are_isolated_until_switch() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (bob, _bob_events) = connect_user(addr, "bob", Some("v4")).await;

    bob.start_editing("parcel", "P9");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice.presence_list().is_empty());
    assert!(!alice.is_being_edited("parcel", "P9"));

    bob.switch_context("v3");
    assert_eq!(bob.current_context_id().as_deref(), Some("v3"));

    assert!(wait_until(|| alice.presence_list().iter().any(|p| p.user_id == "bob")).await);
    assert!(wait_until(|| bob.presence_list().iter().any(|p| p.user_id == "alice")).await);
}

// ─────────────────────────────────────────────────────────────────
// Change Feed
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_published_changes_reach_feed_newest_first() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, mut alice_events) = connect_user(addr, "alice", Some("v3")).await;

    publish_when_joined(
        &handle,
        "v3",
        EntityChange::new("task", "T1", "updated").with_author("bob"),
    )
    .await;
    for id in ["T2", "T3"] {
        assert!(
            handle
                .publish_change(Some("v3"), EntityChange::new("task", id, "updated"))
                .await
        );
    }

    let first = next_matching(&mut alice_events, |e| {
        matches!(e, CoordinatorEvent::EntityChanged(_))
    })
    .await;
    match first {
        Some(CoordinatorEvent::EntityChanged(change)) => {
            assert_eq!(change.entity_id, "T1");
            assert_eq!(change.author_user_id.as_deref(), Some("bob"));
        }
        other => panic!("Expected EntityChanged, got {other:?}"),
    }

    assert!(wait_until(|| alice.recent_changes().len() == 3).await);
    let ids: Vec<_> = alice
        .recent_changes()
        .into_iter()
        .map(|c| c.entity_id)
        .collect();
    assert_eq!(ids, ["T3", "T2", "T1"]);
}

#[tokio::test]
async fn test_changes_stay_within_context() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (bob, _bob_events) = connect_user(addr, "bob", Some("v4")).await;

    publish_when_joined(&handle, "v4", EntityChange::new("parcel", "P1", "deleted")).await;

    assert!(wait_until(|| bob.recent_changes().len() == 1).await);
    assert_eq!(bob.recent_changes()[0].change_kind, "deleted");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice.recent_changes().is_empty());
}

// ─────────────────────────────────────────────────────────────────
// Server Behavior
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_without_user_id_is_rejected() {
    let handle = start_server().await;
    let url = format!("ws://{}/ws", handle.local_addr());

    let result = connect_async(url.as_str()).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        Err(other) => panic!("Expected HTTP rejection, got {other}"),
        Ok(_) => panic!("Handshake without user_id should fail"),
    }
}

#[tokio::test]
async fn test_server_answers_ping_and_skips_garbage() {
    let handle = start_server().await;
    let url = format!("ws://{}/ws?user_id=raw", handle.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.expect("connect");

    ws.send(WsMessage::Text("not json".to_string())).await.unwrap();
    ws.send(WsMessage::Text(r#"{"type":"mystery","x":1}"#.to_string()))
        .await
        .unwrap();
    ws.send(WsMessage::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();

    let mut seen = Vec::new();
    let complete = tokio::time::timeout(WAIT, async {
        while let Some(Ok(frame)) = ws.next().await {
            if let WsMessage::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).unwrap();
                seen.push(value["type"].as_str().unwrap_or_default().to_string());
                if seen.iter().any(|k| k == "pong") && seen.iter().any(|k| k == "presence_list") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    assert!(complete, "expected pong and presence_list, saw {seen:?}");
}

#[tokio::test]
async fn test_server_stats_track_connections() {
    let handle = start_server().await;
    let addr = handle.local_addr();

    let (_alice, _alice_events) = connect_user(addr, "alice", Some("v3")).await;
    let (mut bob, _bob_events) = connect_user(addr, "bob", None).await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = handle.stats().await;
        if stats.active_connections == 2 && stats.active_contexts == 2 {
            assert_eq!(stats.total_connections, 2);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stats never settled: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    bob.shutdown().await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stats = handle.stats().await;
        if stats.active_connections == 1 && stats.active_contexts == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "bob never left: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Reconnection
// ─────────────────────────────────────────────────────────────────

/// Endpoint that closes its first connection on demand and records the
/// text frames of the second
async fn flaky_endpoint() -> (SocketAddr, oneshot::Sender<()>, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (drop_tx, drop_rx) = oneshot::channel::<()>();
    let (seen_tx, seen_rx) = mpsc::channel(16);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = accept_async(stream).await.unwrap();
        let _ = drop_rx.await;
        let _ = first.send(WsMessage::Close(None)).await;
        drop(first);

        let (stream, _) = listener.accept().await.unwrap();
        let mut second = accept_async(stream).await.unwrap();
        while let Some(Ok(frame)) = second.next().await {
            if let WsMessage::Text(text) = frame {
                if seen_tx.send(text).await.is_err() {
                    break;
                }
            }
        }
    });

    (addr, drop_tx, seen_rx)
}

#[tokio::test]
async fn test_reconnects_and_reannounces_intent() {
    let (addr, drop_tx, mut seen) = flaky_endpoint().await;

    let mut alice = Coordinator::new(
        session_config(addr, Some("v3")),
        Identity::new("alice", "Alice"),
    );
    let mut events = alice.start().unwrap();
    assert!(wait_until(|| alice.is_connected()).await);

    alice.start_editing("parcel", "P9");
    drop_tx.send(()).unwrap();

    let reconnecting = next_matching(&mut events, |e| {
        matches!(e, CoordinatorEvent::Reconnecting { .. })
    })
    .await;
    match reconnecting {
        Some(CoordinatorEvent::Reconnecting { attempt, delay }) => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(50));
        }
        other => panic!("Expected Reconnecting, got {other:?}"),
    }

    let text = tokio::time::timeout(WAIT, seen.recv())
        .await
        .expect("no frame after reconnect")
        .expect("endpoint closed");
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "start_editing");
    assert_eq!(value["entity_type"], "parcel");
    assert_eq!(value["entity_id"], "P9");

    assert!(wait_until(|| alice.is_connected() && alice.reconnect_attempt() == 0).await);
    alice.shutdown().await;
    assert_eq!(alice.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_endpoint_keeps_retrying() {
    // Reserve a port, then free it so nothing is listening
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut coordinator = Coordinator::new(session_config(addr, None), Identity::new("solo", "Solo"));
    let mut events = coordinator.start().unwrap();

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        match next_matching(&mut events, |e| matches!(e, CoordinatorEvent::Reconnecting { .. })).await {
            Some(CoordinatorEvent::Reconnecting { attempt, .. }) => attempts.push(attempt),
            other => panic!("Expected Reconnecting, got {other:?}"),
        }
    }
    assert_eq!(attempts, [1, 2, 3]);
    assert!(!coordinator.is_connected());

    // Operations while disconnected are accepted and dropped
    coordinator.start_editing("parcel", "P9");
    coordinator.switch_context("v9");
    assert_eq!(coordinator.current_context_id().as_deref(), Some("v9"));

    coordinator.shutdown().await;
    assert!(coordinator.start().is_err());
}
