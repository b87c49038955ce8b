//! Integration tests for what happens after two clients are paired.

mod common;

use common::{TestClient, TestServer};
use rendezvous_proto::{ClientMessage, PeerConnectionState, ServerMessage};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(300);

/// Pair two fresh clients; `b` ends up as initiator.
async fn paired(server: &TestServer) -> (TestClient, TestClient) {
    let mut a = server.connect().await.unwrap();
    let mut b = server.connect().await.unwrap();
    a.find_partner("peer-a").await.unwrap();
    assert_eq!(a.recv().await.unwrap(), ServerMessage::Waiting);
    b.find_partner("peer-b").await.unwrap();
    assert!(matches!(b.recv().await.unwrap(), ServerMessage::Paired { .. }));
    assert!(matches!(a.recv().await.unwrap(), ServerMessage::Paired { .. }));
    (a, b)
}

#[tokio::test]
async fn test_end_session_notifies_partner() {
    let server = TestServer::spawn(17201).await.expect("spawn server");
    let (mut a, mut b) = paired(&server).await;

    a.send(ClientMessage::EndSession).await.unwrap();
    assert_eq!(a.recv().await.unwrap(), ServerMessage::SessionEnded);
    assert_eq!(
        b.recv().await.unwrap(),
        ServerMessage::PartnerDisconnected { involuntary: false }
    );

    // Both are idle again and pair with each other.
    b.find_partner("peer-b").await.unwrap();
    assert_eq!(b.recv().await.unwrap(), ServerMessage::Waiting);
    a.find_partner("peer-a").await.unwrap();
    assert!(matches!(a.recv().await.unwrap(), ServerMessage::Paired { .. }));
}

#[tokio::test]
async fn test_partner_dropping_is_involuntary() {
    let server = TestServer::spawn(17202).await.expect("spawn server");
    let (a, mut b) = paired(&server).await;

    drop(a);
    assert_eq!(
        b.recv().await.unwrap(),
        ServerMessage::PartnerDisconnected { involuntary: true }
    );
}

#[tokio::test]
async fn test_failure_before_connect_reports_unreachable() {
    let server = TestServer::spawn(17203).await.expect("spawn server");
    let (mut a, mut b) = paired(&server).await;

    b.peer_state(PeerConnectionState::Connecting).await.unwrap();
    b.peer_state(PeerConnectionState::Failed).await.unwrap();
    assert_eq!(b.recv().await.unwrap(), ServerMessage::PartnerUnreachable);
    a.expect_silence(QUIET).await.unwrap();

    // The receiver was released too.
    a.find_partner("peer-a").await.unwrap();
    assert_eq!(a.recv().await.unwrap(), ServerMessage::Waiting);
}

#[tokio::test]
async fn test_connection_closing_after_connect_ends_session() {
    let server = TestServer::spawn(17204).await.expect("spawn server");
    let (mut a, mut b) = paired(&server).await;

    b.peer_state(PeerConnectionState::Connected).await.unwrap();
    a.peer_state(PeerConnectionState::Connected).await.unwrap();
    b.expect_silence(QUIET).await.unwrap();

    b.peer_state(PeerConnectionState::Closed).await.unwrap();
    assert_eq!(b.recv().await.unwrap(), ServerMessage::SessionEnded);
    assert_eq!(
        a.recv().await.unwrap(),
        ServerMessage::PartnerDisconnected { involuntary: false }
    );
}

#[tokio::test]
async fn test_requests_out_of_phase_are_silent() {
    let server = TestServer::spawn(17205).await.expect("spawn server");
    let mut a = server.connect().await.unwrap();

    a.send(ClientMessage::EndSession).await.unwrap();
    a.peer_state(PeerConnectionState::Connected).await.unwrap();
    a.send(ClientMessage::CancelSearch).await.unwrap();
    a.expect_silence(QUIET).await.unwrap();
}

#[tokio::test]
async fn test_flooding_client_is_disconnected() {
    let server = TestServer::spawn_with(
        17206,
        r#"
[limits]
message_rate_per_second = 1
connection_burst_per_ip = 100
"#,
    )
    .await
    .expect("spawn server");
    let mut a = server.connect().await.unwrap();

    for i in 0..4 {
        a.send(ClientMessage::Ping {
            token: Some(format!("t-{i}")),
        })
        .await
        .unwrap();
    }

    assert!(matches!(a.recv().await.unwrap(), ServerMessage::Pong { .. }));
    let mut codes = Vec::new();
    while let Ok(ServerMessage::Error { code, .. }) = a.recv().await {
        codes.push(code);
    }
    assert_eq!(codes, ["rate_limited", "rate_limited", "flood"]);
    assert!(a.is_closed(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_silent_client_is_pinged_then_dropped() {
    let server = TestServer::spawn_with(
        17207,
        r#"
[idle_timeouts]
ping = 1
timeout = 1
"#,
    )
    .await
    .expect("spawn server");
    let mut a = server.connect().await.unwrap();

    let ping = a.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert!(matches!(ping, ServerMessage::Ping { .. }));

    match a.recv_timeout(Duration::from_secs(5)).await.unwrap() {
        ServerMessage::Error { code, .. } => assert_eq!(code, "ping_timeout"),
        other => panic!("expected ping timeout, got {other:?}"),
    }
    assert!(a.is_closed(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_answered_pings_keep_connection() {
    let server = TestServer::spawn_with(
        17208,
        r#"
[idle_timeouts]
ping = 1
timeout = 2
"#,
    )
    .await
    .expect("spawn server");
    let mut a = server.connect().await.unwrap();

    for _ in 0..2 {
        let ServerMessage::Ping { token } = a.recv_timeout(Duration::from_secs(5)).await.unwrap()
        else {
            panic!("expected ping");
        };
        a.send(ClientMessage::Pong { token }).await.unwrap();
    }

    a.find_partner("peer-a").await.unwrap();
    assert_eq!(
        a.recv_until(|m| !matches!(m, ServerMessage::Ping { .. }))
            .await
            .unwrap(),
        ServerMessage::Waiting
    );
}
