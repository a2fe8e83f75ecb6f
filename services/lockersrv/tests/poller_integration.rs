//! Poller integration tests
//!
//! Drive the poller against a `BuSimulator` and check what reaches the sinks.
//!
//! # Running Tests
//! ```bash
//! cargo test --package lockersrv --test poller_integration
//! ```

#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use kerong_protocol::{Command, DecodeOptions, LockState};
use lockersrv::{
    AppConfig, BroadcastSink, BuSimulator, LatestStatusSink, LockerService, Poller, PollerConfig,
    ResponseMatching, SessionState,
};

use common::{connected_session, session_config, wait_for_state, PROMPT};

fn poller_config(interval: Duration) -> PollerConfig {
    PollerConfig {
        addresses: vec![0x00, 0x01],
        interval,
        decode: DecodeOptions::default(),
    }
}

#[tokio::test]
async fn test_poll_once_round_robin() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;
    let sink = Arc::new(LatestStatusSink::new());
    let poller = Poller::new(
        session.clone(),
        poller_config(Duration::from_secs(60)),
        sink.clone(),
    );

    assert_eq!(poller.poll_once().await, Some(0x00));
    assert_eq!(poller.poll_once().await, Some(0x01));
    assert_eq!(poller.poll_once().await, Some(0x00));

    assert!(simulator.wait_for_requests(3, PROMPT).await);
    assert_eq!(
        simulator.requested_addresses(Command::GetStatus),
        vec![0x00, 0x01, 0x00]
    );
    assert_eq!(poller.stats().requests_sent, 3);

    session.stop().await;
}

#[tokio::test]
async fn test_timed_polling_publishes_statuses() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_hooks(0x00, 0x0FFF);
    simulator.set_hooks(0x01, 0x0002);
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;
    let sink = Arc::new(BroadcastSink::new(16));
    let mut updates = sink.subscribe();
    let poller = Poller::new(
        session.clone(),
        poller_config(Duration::from_millis(50)),
        sink.clone(),
    );

    let task = poller.start();
    assert!(simulator.wait_for_requests(3, PROMPT).await);
    let addresses = simulator.requested_addresses(Command::GetStatus);
    assert_eq!(&addresses[..3], &[0x00, 0x01, 0x00]);

    let first = tokio::time::timeout(PROMPT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.addr, 0x00);
    assert_eq!(first.status.locked_count(), 12);

    let second = tokio::time::timeout(PROMPT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.addr, 0x01);
    assert_eq!(second.status.state(1), Some(LockState::Locked));
    assert_eq!(second.status.state(0), Some(LockState::Unlocked));

    session.stop().await;
    tokio::time::timeout(PROMPT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_polling_pauses_while_disconnected() {
    let simulator = BuSimulator::start().await.unwrap();
    let session = connected_session(&simulator, ResponseMatching::NextChunk, None).await;
    let poller = Poller::new(
        session.clone(),
        poller_config(Duration::from_secs(60)),
        Arc::new(LatestStatusSink::new()),
    );

    assert_eq!(poller.poll_once().await, Some(0x00));
    assert!(simulator.wait_for_requests(1, PROMPT).await);

    simulator.drop_connections();
    assert!(wait_for_state(&session, SessionState::Disconnected, PROMPT).await);

    assert_eq!(poller.poll_once().await, None);
    assert_eq!(poller.next_address(), Some(0x01));

    assert!(wait_for_state(&session, SessionState::Connected, PROMPT).await);
    assert_eq!(poller.poll_once().await, Some(0x01));
    assert!(simulator.wait_for_requests(2, PROMPT).await);
    assert_eq!(
        simulator.requested_addresses(Command::GetStatus),
        vec![0x00, 0x01]
    );

    session.stop().await;
}

#[tokio::test]
async fn test_exclusive_unlock_not_answered_by_poll_reply() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_hooks(0x00, 0x0FFF);
    let session = connected_session(&simulator, ResponseMatching::Exclusive, None).await;
    let sink = Arc::new(LatestStatusSink::new());
    let poller = Poller::new(
        session.clone(),
        poller_config(Duration::from_millis(5)),
        sink.clone(),
    );
    let task = poller.start();

    for compartment in 0..6 {
        let response = session
            .send_unlock(compartment, 0x00)
            .await
            .expect("unlock response");
        assert_eq!(response[3], Command::Unlock.code());
        assert_eq!(response[2], compartment);
    }
    assert_eq!(simulator.hooks(0x00), 0x0FC0);

    session.stop().await;
    tokio::time::timeout(PROMPT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_service_end_to_end() {
    let simulator = BuSimulator::start().await.unwrap();
    simulator.set_hooks(0x01, 0x0004);

    let mut config = AppConfig::default();
    config.controller.host = simulator.host();
    config.controller.port = simulator.port();
    config.polling.addresses = vec![0x01];
    config.polling.interval_ms = 20;
    config.protocol.strict_checksum = true;
    config.session.unlock_timeout_ms = Some(1000);

    let service = LockerService::new(&config);
    let mut updates = service.subscribe();
    assert!(service.start().await);

    let update = tokio::time::timeout(PROMPT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.addr, 0x01);
    assert!(service.latest_status(0x01).unwrap().is_locked(2));

    let response = service.unlock(2, 0x01).await.unwrap();
    assert!(response.len() >= 8);

    service.stop().await;
    assert_eq!(service.state(), SessionState::Disconnected);
    assert!(service.poller_stats().statuses_published >= 1);
}

#[tokio::test]
async fn test_session_config_helper_targets_simulator() {
    let simulator = BuSimulator::start().await.unwrap();
    let config = session_config(&simulator);
    assert_eq!(config.port, simulator.port());
    assert_eq!(config.response_matching, ResponseMatching::NextChunk);
}
