//! Integration tests for node connections against a local WebSocket server

mod common;

use common::{closed_port, TestNode, WAIT};
use lavaplay::{
    ClientIdentity, ConnectionStatus, NodeConfig, NodeConnection, NodeReceiver, NodeSignal,
    OutgoingMessage,
};
use serde_json::json;
use std::time::Duration;

fn identity() -> ClientIdentity {
    ClientIdentity {
        user_id: 42,
        shard_count: 3,
    }
}

fn config(port: u16, reconnect_interval_ms: u64) -> NodeConfig {
    NodeConfig {
        port,
        password: "secret".to_string(),
        reconnect_interval_ms,
        auto_reconnect: false,
        ..NodeConfig::new("127.0.0.1")
    }
}

async fn next_signal(signals: &mut NodeReceiver) -> NodeSignal {
    tokio::time::timeout(WAIT, signals.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signal channel closed")
}

#[tokio::test]
async fn connect_sends_identity_headers() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 5000), identity());
    let mut signals = node.subscribe();

    node.connect().await.unwrap();
    let conn = server.accept().await;

    assert_eq!(node.status(), ConnectionStatus::Open);
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Ready));
    assert_eq!(conn.header("Authorization").as_deref(), Some("secret"));
    assert_eq!(conn.header("User-Id").as_deref(), Some("42"));
    assert_eq!(conn.header("Num-Shards").as_deref(), Some("3"));

    node.destroy();
}

#[tokio::test]
async fn sends_arrive_in_issue_order() {
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 5000), identity());
    node.connect().await.unwrap();
    let mut conn = server.accept().await;

    assert!(node.send(&OutgoingMessage::Play {
        guild_id: "1".into(),
        track: "abc".into(),
        start_time: None,
        end_time: None,
    }));
    assert!(node.send(&OutgoingMessage::Pause { guild_id: "1".into(), pause: true }));
    assert!(node.send(&OutgoingMessage::Stop { guild_id: "1".into() }));

    assert_eq!(conn.next_frame().await.unwrap()["op"], "play");
    assert_eq!(conn.next_frame().await.unwrap()["op"], "pause");
    assert_eq!(conn.next_frame().await.unwrap()["op"], "stop");

    node.destroy();
}

#[tokio::test]
async fn inbound_frames_are_cached_or_forwarded() {
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 5000), identity());
    let mut signals = node.subscribe();
    node.connect().await.unwrap();
    let conn = server.accept().await;
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Ready));

    conn.send_json(json!({"op": "stats", "players": 4, "playingPlayers": 2, "uptime": 1000}));
    conn.send_raw("this is not json");
    conn.send_json(json!({"op": "playerUpdate", "guildId": "9", "state": {"position": 10}}));

    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Error(_)));
    match next_signal(&mut signals).await {
        NodeSignal::Message(message) => assert_eq!(message["op"], "playerUpdate"),
        other => panic!("unexpected signal: {:?}", other),
    }

    // Frames are handled in arrival order, so the stats report is cached by now
    assert_eq!(node.stats().map(|s| s.playing_players), Some(2));
    assert!(node.is_open());

    node.destroy();
}

#[tokio::test]
async fn server_close_reports_code_and_reason() {
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 5000), identity());
    let mut signals = node.subscribe();
    node.connect().await.unwrap();
    let conn = server.accept().await;
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Ready));

    conn.close();

    match next_signal(&mut signals).await {
        NodeSignal::Disconnected { code, reason } => {
            assert_eq!(code, Some(1001));
            assert_eq!(reason, "going away");
        }
        other => panic!("unexpected signal: {:?}", other),
    }
    assert_eq!(node.status(), ConnectionStatus::Disconnected);
    assert!(!node.send(&OutgoingMessage::Stop { guild_id: "1".into() }));
}

#[tokio::test]
async fn destroy_closes_socket_and_is_idempotent() {
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 5000), identity());
    node.connect().await.unwrap();
    let mut conn = server.accept().await;

    assert!(node.destroy());
    assert!(!node.destroy());

    assert!(conn.next_frame().await.is_none());
    assert_eq!(node.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn failed_connect_is_not_retried_without_reconnect() {
    let node = NodeConnection::new(config(closed_port().await, 20), identity());
    let mut signals = node.subscribe();

    assert!(node.connect().await.is_err());
    assert!(matches!(
        next_signal(&mut signals).await,
        NodeSignal::Disconnected { code: None, .. }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(signals.try_recv().unwrap().is_none());
    assert_eq!(node.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn reconnect_against_dead_node_never_opens() {
    let node = NodeConnection::new(config(closed_port().await, 50), identity());
    let mut signals = node.subscribe();

    node.arm_reconnect();

    // Each interval yields exactly one attempt: Reconnecting, then the failure
    for _ in 0..3 {
        assert!(matches!(next_signal(&mut signals).await, NodeSignal::Reconnecting));
        assert!(matches!(
            next_signal(&mut signals).await,
            NodeSignal::Disconnected { code: None, .. }
        ));
        assert_ne!(node.status(), ConnectionStatus::Open);
    }

    node.destroy();
    assert!(!node.is_reconnect_armed());
}

#[tokio::test]
async fn reconnect_armed_while_open_recovers_after_drop() {
    let mut server = TestNode::start().await;
    let node = NodeConnection::new(config(server.port, 50), identity());
    let mut signals = node.subscribe();

    node.connect().await.unwrap();
    let first = server.accept().await;
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Ready));

    node.arm_reconnect();
    // Ticks while open do nothing
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(signals.try_recv().unwrap().is_none());

    first.close();
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Disconnected { .. }));
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Reconnecting));
    assert!(matches!(next_signal(&mut signals).await, NodeSignal::Ready));

    let mut second = server.accept().await;
    assert!(node.is_open());
    assert!(node.send(&OutgoingMessage::Stop { guild_id: "5".into() }));
    assert_eq!(second.next_frame().await.unwrap()["guildId"], "5");

    node.destroy();
}
