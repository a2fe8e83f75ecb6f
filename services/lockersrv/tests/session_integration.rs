//! Controller session integration tests
//!
//! Every test runs against an in-process `BuSimulator` on a loopback port, so
//! no controller hardware is needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --package lockersrv --test session_integration
//! ```

#![allow(clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use kerong_protocol::Command;
use lockersrv::{BuSimulator, ControllerSession, LockerError, ResponseMatching, SessionState};

use common::{connected_session, session_config, wait_for_state, PROMPT, TEST_RECONNECT_DELAY};

#[tokio::test]
async fn test_unlock_round_trip() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_hooks(0x00, 0x0008);
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;

    let response = session.send_unlock(3, 0x00).await.expect("unlock response");

    assert_eq!(response.len(), 10);
    assert_eq!(response[3], Command::Unlock.code());
    assert_eq!(
        simulator.requests(),
        vec![vec![0x02, 0x00, 0x03, 0x81, 0x00, 0x00, 0x03, 0x89]]
    );
    assert_eq!(simulator.hooks(0x00), 0x0000);
    assert_eq!(session.pending_requests(), 0);

    session.stop().await;
}

#[tokio::test]
async fn test_unlock_times_out_when_controller_is_silent() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_silent(true);
    let session = connected_session(
        &simulator,
        ResponseMatching::NextChunk,
        Some(Duration::from_millis(200)),
    )
    .await;

    let result = session.try_send_unlock(1, 0x01).await;

    assert!(matches!(result, Err(LockerError::TimeoutError(_))));
    assert_eq!(session.pending_requests(), 0);
    // The link itself stays up
    assert!(session.is_connected());

    session.stop().await;
}

#[tokio::test]
async fn test_pending_unlock_released_on_disconnect() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_silent(true);
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.send_unlock(5, 0x00).await })
    };
    assert!(simulator.wait_for_requests(1, PROMPT).await);

    simulator.drop_connections();

    let result = tokio::time::timeout(PROMPT, pending)
        .await
        .expect("unlock should resolve after the link drops")
        .unwrap();
    assert!(result.is_none());

    session.stop().await;
}

#[tokio::test]
async fn test_reconnects_once_after_peer_close() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;
    assert_eq!(simulator.connection_count(), 1);

    simulator.drop_connections();

    assert!(wait_for_state(&session, SessionState::Disconnected, PROMPT).await);
    assert_eq!(session.send_unlock(0, 0x00).await, None);

    // Nothing happens before the reconnect delay elapses
    tokio::time::sleep(TEST_RECONNECT_DELAY / 4).await;
    assert_eq!(simulator.connection_count(), 1);

    assert!(simulator.wait_for_connections(2, PROMPT).await);
    assert!(wait_for_state(&session, SessionState::Connected, PROMPT).await);

    // Exactly one attempt per outage once it succeeds
    tokio::time::sleep(TEST_RECONNECT_DELAY * 3).await;
    assert_eq!(simulator.connection_count(), 2);
    let stats = session.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.reconnect_attempts, 1);

    // The same session object serves the new socket
    simulator.set_hooks(0x00, 0x0001);
    assert!(session.send_unlock(0, 0x00).await.is_some());

    session.stop().await;
}

#[tokio::test]
async fn test_start_retries_until_controller_appears() {
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let mut config = lockersrv::SessionConfig::new("127.0.0.1", port);
    config.reconnect = lockersrv::ReconnectPolicy::fixed(TEST_RECONNECT_DELAY);
    let session = ControllerSession::new(config);

    assert!(!session.start().await);
    assert_eq!(session.state(), SessionState::Disconnected);

    let simulator = BuSimulator::bind(&format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    assert!(wait_for_state(&session, SessionState::Connected, PROMPT * 2).await);
    assert_eq!(simulator.connection_count(), 1);
    assert!(session.stats().reconnect_attempts >= 1);

    session.stop().await;
}

#[tokio::test]
async fn test_stop_prevents_reconnect() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;

    session.stop().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    tokio::time::sleep(TEST_RECONNECT_DELAY * 3).await;
    assert_eq!(simulator.connection_count(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.connect(&simulator.host(), simulator.port()).await);
}

#[tokio::test]
async fn test_explicit_connect_replaces_socket() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = ControllerSession::new(session_config(&simulator));

    assert!(session.connect(&simulator.host(), simulator.port()).await);
    assert!(session.connect(&simulator.host(), simulator.port()).await);
    assert!(simulator.wait_for_connections(2, PROMPT).await);

    // The superseded socket closing must not tear down the live one
    tokio::time::sleep(TEST_RECONNECT_DELAY).await;
    assert!(session.is_connected());
    assert_eq!(session.stats().disconnects, 0);
    assert!(session.send_unlock(2, 0x01).await.is_some());

    session.stop().await;
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_failed_connect_keeps_live_controller() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;

    assert!(!session.connect("127.0.0.1", closed_port().await).await);
    let err = session
        .try_connect("127.0.0.1", closed_port().await)
        .await
        .unwrap_err();
    assert!(matches!(err, LockerError::ConnectionError(_)));

    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.send_unlock(1, 0x00).await.is_some());

    // Recovery still targets the controller that was actually reached
    simulator.drop_connections();
    assert!(simulator.wait_for_connections(2, PROMPT).await);
    assert!(wait_for_state(&session, SessionState::Connected, PROMPT).await);
    assert!(session.send_unlock(2, 0x00).await.is_some());

    session.stop().await;
}

#[tokio::test]
async fn test_outage_during_retry_reconnects_once() {
    let simulator = BuSimulator::start().await.unwrap();
    let mut config = session_config(&simulator);
    config.port = closed_port().await;
    let session = ControllerSession::new(config);

    assert!(!session.start().await);
    assert!(session.is_reconnecting());

    // Explicit connect while the retry loop sleeps, then lose that link
    assert!(session.connect(&simulator.host(), simulator.port()).await);
    simulator.drop_connections();

    assert!(simulator.wait_for_connections(2, PROMPT).await);
    assert!(wait_for_state(&session, SessionState::Connected, PROMPT).await);
    tokio::time::sleep(TEST_RECONNECT_DELAY * 3).await;

    assert_eq!(simulator.connection_count(), 2);
    assert!(session.is_connected());
    assert!(!session.is_reconnecting());

    session.stop().await;
}
