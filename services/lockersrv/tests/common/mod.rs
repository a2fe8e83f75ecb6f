//! Shared helpers for lockersrv integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lockersrv::{
    BuSimulator, ControllerSession, ReconnectPolicy, ResponseMatching, SessionConfig, SessionState,
};

/// Reconnect delay used against the simulator
pub const TEST_RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Upper bound for anything that should happen "promptly"
pub const PROMPT: Duration = Duration::from_secs(2);

pub fn session_config(simulator: &BuSimulator) -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(1),
        reconnect: ReconnectPolicy::fixed(TEST_RECONNECT_DELAY),
        ..SessionConfig::new(simulator.host(), simulator.port())
    }
}

/// Session connected to `simulator` with the given matching mode
pub async fn connected_session(
    simulator: &BuSimulator,
    matching: ResponseMatching,
    unlock_timeout: Option<Duration>,
) -> Arc<ControllerSession> {
    let mut config = session_config(simulator);
    config.response_matching = matching;
    config.unlock_timeout = unlock_timeout;

    let session = ControllerSession::new(config);
    assert!(session.start().await, "session failed to connect to simulator");
    assert_eq!(session.state(), SessionState::Connected);
    session
}

/// Poll the session state until it equals `expected` or `limit` passes
pub async fn wait_for_state(
    session: &ControllerSession,
    expected: SessionState,
    limit: Duration,
) -> bool {
    let mut rx = session.subscribe_state();
    let result = tokio::time::timeout(limit, async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    result.is_ok() && session.state() == expected
}
