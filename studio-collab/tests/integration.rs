//! Integration tests for end-to-end collaboration over the relay.
//!
//! These tests start a real relay and connect real transports and
//! sessions, verifying the full pipeline.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{Arc, Mutex};
use studio_collab::client::{ConnectionState, TransportClient, TransportEvent, TransportEventKind};
use studio_collab::collab::{CollaborationManager, CollaborationProvider, SessionEvent, Topic};
use studio_collab::config::{CollabConfig, TransportConfig};
use studio_collab::events::{CollabEventType, CommentDraft, EventBody};
use studio_collab::ot::OperationDraft;
use studio_collab::protocol::{Envelope, HeartbeatKind, MessageType, SendOptions};
use studio_collab::server::{RelayConfig, RelayServer};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Start a relay on a free port, return its URL.
async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
    });
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://127.0.0.1:{port}")
}

/// Poll until `condition` holds, failing after two seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn record_messages(client: &TransportClient) -> Arc<Mutex<Vec<Envelope>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.on(TransportEventKind::Message, move |event| {
        if let TransportEvent::Message(envelope) = event {
            sink.lock().unwrap().push(envelope.clone());
        }
    });
    seen
}

fn record_session(manager: &CollaborationManager, topic: Topic) -> Arc<Mutex<Vec<SessionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.on(topic, move |event| sink.lock().unwrap().push(event.clone()));
    seen
}

fn opts(user: &str, project: &str) -> SendOptions {
    SendOptions::new().user(user).project(project)
}

async fn started(url: &str, project: &str, user: &str) -> CollaborationManager {
    let transport = TransportClient::new(TransportConfig::new(url));
    let manager = CollaborationManager::new(CollabConfig::new(project, user, user), transport);
    manager.start().await.unwrap();
    manager
}

#[tokio::test]
async fn test_transport_connects_to_relay() {
    let url = start_relay().await;
    let client = TransportClient::new(TransportConfig::new(&url));

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    client.on(TransportEventKind::ConnectionChange, move |event| {
        if let TransportEvent::ConnectionChanged(state) = event {
            sink.lock().unwrap().push(*state);
        }
    });

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert_eq!(
        *states.lock().unwrap(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    // Connecting again is a no-op
    client.connect().await.unwrap();
    assert_eq!(states.lock().unwrap().len(), 2);

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_timers(), 0);
}

#[tokio::test]
async fn test_offline_queue_flushed_in_order() {
    let url = start_relay().await;

    let observer = TransportClient::new(TransportConfig::new(&url));
    let seen = record_messages(&observer);
    observer.connect().await.unwrap();
    observer.send(MessageType::ProjectSync, json!({}), opts("observer", "proj"));

    let sender = TransportClient::new(TransportConfig::new(&url));
    for n in 1..=3 {
        sender.send(MessageType::FeedbackUpdate, json!({ "n": n }), opts("sender", "proj"));
    }
    assert_eq!(sender.queued_len(), 3);

    // Let the observer join the room before the queue drains
    sleep(Duration::from_millis(50)).await;
    sender.connect().await.unwrap();
    assert_eq!(sender.queued_len(), 0);

    wait_until("three relayed messages", || seen.lock().unwrap().len() == 3).await;
    let seen = seen.lock().unwrap();
    let order: Vec<_> = seen.iter().map(|e| e.payload["n"].clone()).collect();
    assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
    let sequences: Vec<_> = seen.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![Some(1), Some(2), Some(3)]);
}

#[tokio::test]
async fn test_relay_reports_presence() {
    let url = start_relay().await;
    let observer = TransportClient::new(TransportConfig::new(&url));
    observer.connect().await.unwrap();
    observer.send(MessageType::ProjectSync, json!({}), opts("observer", "proj"));
    sleep(Duration::from_millis(50)).await;

    let visitor = TransportClient::new(TransportConfig::new(&url));
    visitor.connect().await.unwrap();
    visitor.send(MessageType::ProjectSync, json!({}), opts("visitor", "proj"));
    wait_until("visitor online", || {
        observer.online_users().contains(&"visitor".to_string())
    })
    .await;

    visitor.disconnect();
    wait_until("visitor offline", || {
        !observer.online_users().contains(&"visitor".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let url = start_relay().await;
    let other = TransportClient::new(TransportConfig::new(&url));
    let seen = record_messages(&other);
    other.connect().await.unwrap();
    other.send(MessageType::ProjectSync, json!({}), opts("other", "proj-2"));
    sleep(Duration::from_millis(50)).await;

    let sender = TransportClient::new(TransportConfig::new(&url));
    sender.connect().await.unwrap();
    sender.send(MessageType::Comment, json!({ "room": 1 }), opts("sender", "proj-1"));
    sender.send(MessageType::Comment, json!({ "room": 2 }), opts("sender", "proj-2"));

    wait_until("marker in proj-2", || !seen.lock().unwrap().is_empty()).await;
    sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload["room"], json!(2));
}

#[tokio::test]
async fn test_relay_answers_heartbeat() {
    let url = start_relay().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket.send(Message::text("not json")).await.unwrap();
    let ping = Envelope::heartbeat(HeartbeatKind::Ping).encode().unwrap();
    socket.send(Message::text(ping)).await.unwrap();

    let reply = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("pong within timeout")
        .unwrap()
        .unwrap();
    let envelope = match reply {
        Message::Text(text) => Envelope::decode(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    };
    assert_eq!(envelope.heartbeat_kind(), Some(HeartbeatKind::Pong));
}

#[tokio::test]
async fn test_managers_exchange_comments() {
    let url = start_relay().await;
    let alice = started(&url, "proj", "alice").await;
    sleep(Duration::from_millis(50)).await;
    let bob = started(&url, "proj", "bob").await;

    wait_until("alice sees bob", || alice.get_user("bob").is_some()).await;

    let received = record_session(&bob, Topic::Event(CollabEventType::CommentAdded));
    let id = alice
        .add_comment(CommentDraft::new("Cut earlier here").at(12.5))
        .unwrap();

    wait_until("comment delivered", || !received.lock().unwrap().is_empty()).await;
    let received = received.lock().unwrap();
    match &received[0] {
        SessionEvent::Remote(event) => match &event.body {
            EventBody::CommentAdded(comment) => {
                assert_eq!(comment.id, id);
                assert_eq!(comment.author_id, "alice");
                assert_eq!(comment.video_time, Some(12.5));
            }
            other => panic!("expected comment, got {other:?}"),
        },
        other => panic!("expected remote event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_operations_merge_remote_clock() {
    let url = start_relay().await;
    let alice = started(&url, "proj", "alice").await;
    sleep(Duration::from_millis(50)).await;
    let bob = started(&url, "proj", "bob").await;
    wait_until("alice sees bob", || alice.get_user("bob").is_some()).await;

    bob.apply_operation(OperationDraft::insert(0, "hello")).unwrap();
    bob.apply_operation(OperationDraft::insert(5, " world")).unwrap();

    wait_until("alice merged bob's clock", || alice.vector_clock().get("bob") == 2).await;
    assert_eq!(alice.vector_clock().get("alice"), 0);
    assert!(alice.buffered_operations().is_empty());
}

#[tokio::test]
async fn test_stop_marks_participant_offline() {
    let url = start_relay().await;
    let alice = started(&url, "proj", "alice").await;
    sleep(Duration::from_millis(50)).await;
    let bob = started(&url, "proj", "bob").await;
    wait_until("alice sees bob", || {
        alice.get_user("bob").is_some_and(|p| p.is_online)
    })
    .await;

    bob.stop();
    assert!(!bob.is_connected());
    wait_until("bob offline", || {
        alice.get_user("bob").is_some_and(|p| !p.is_online)
    })
    .await;
    assert_eq!(alice.get_collaboration_users().len(), 2);
}

#[tokio::test]
async fn test_provider_sessions_share_transport() {
    let url = start_relay().await;
    let provider = CollaborationProvider::new(TransportConfig::new(&url));
    let review = provider.session(CollabConfig::new("review", "carol", "Carol"));
    let edit = provider.session(CollabConfig::new("edit", "carol", "Carol"));
    review.start().await.unwrap();
    edit.start().await.unwrap();
    let review_events = record_session(&review, Topic::AnyEvent);
    let edit_events = record_session(&edit, Topic::AnyEvent);

    sleep(Duration::from_millis(50)).await;
    let dave = started(&url, "review", "dave").await;
    dave.add_comment(CommentDraft::new("looks good")).unwrap();

    wait_until("review session gets comment", || {
        review_events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SessionEvent::Remote(ev) if ev.event_type() == CollabEventType::CommentAdded))
    })
    .await;
    assert!(edit_events.lock().unwrap().is_empty());

    review.stop();
    assert!(provider.transport().is_connected());
    edit.stop();
    assert!(!provider.transport().is_connected());
}

#[tokio::test]
async fn test_two_devices_of_one_user_both_delivered() {
    let url = start_relay().await;
    let observer = TransportClient::new(TransportConfig::new(&url));
    let seen = record_messages(&observer);
    observer.connect().await.unwrap();
    observer.send(MessageType::ProjectSync, json!({}), opts("bob", "proj"));
    sleep(Duration::from_millis(50)).await;

    let laptop = TransportClient::new(TransportConfig::new(&url));
    let phone = TransportClient::new(TransportConfig::new(&url));
    laptop.connect().await.unwrap();
    phone.connect().await.unwrap();
    for n in 0..5 {
        laptop.send(MessageType::Comment, json!({ "laptop": n }), opts("alice", "proj"));
    }
    phone.send(MessageType::Comment, json!({ "phone": 0 }), opts("alice", "proj"));

    wait_until("six comments", || seen.lock().unwrap().len() == 6).await;
    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|e| e.payload == json!({ "phone": 0 })));
    assert!(seen
        .iter()
        .all(|e| e.user_id.as_deref() == Some("alice") && e.sender_id.is_some()));
}

#[tokio::test]
async fn test_stop_reports_final_disconnect() {
    let url = start_relay().await;
    let alice = started(&url, "proj", "alice").await;
    let connection = record_session(&alice, Topic::Connection);

    alice.stop();
    assert!(matches!(
        connection.lock().unwrap().last(),
        Some(SessionEvent::ConnectionChanged(ConnectionState::Disconnected))
    ));
    // The transport's listener slots were released afterwards
    assert!(!alice.transport().off(TransportEventKind::Message));
}
