//! Service assembly
//!
//! Wires one controller session, the status poller and the sinks together and
//! exposes the operations an outer surface (web handlers, CLI) needs.

use std::sync::Arc;

use bytes::Bytes;
use kerong_protocol::constants::MAX_COMPARTMENT;
use kerong_protocol::{DecodeOptions, LockStatus};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{LockerError, Result};
use crate::poller::{Poller, PollerConfig, PollerStats};
use crate::session::{ControllerSession, SessionState, SessionStats};
use crate::sink::{BroadcastSink, FanOutSink, LatestStatusSink, StatusSink, StatusUpdate};

/// Capacity of the status broadcast channel
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Locker bridge: session, poller and status fan-out
pub struct LockerService {
    session: Arc<ControllerSession>,
    poller: Arc<Poller>,
    updates: Arc<BroadcastSink>,
    latest: Arc<LatestStatusSink>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl LockerService {
    pub fn new(config: &AppConfig) -> Self {
        let poller_config = PollerConfig {
            addresses: config.polling.addresses.clone(),
            interval: config.poll_interval(),
            decode: DecodeOptions {
                verify_checksum: config.protocol.strict_checksum,
            },
        };
        Self::with_parts(
            ControllerSession::new(config.session_config()),
            poller_config,
            None,
        )
    }

    /// Assemble from explicit parts; `extra_sink` receives every update after the built-in sinks
    pub fn with_parts(
        session: Arc<ControllerSession>,
        poller_config: PollerConfig,
        extra_sink: Option<Arc<dyn StatusSink>>,
    ) -> Self {
        let updates = Arc::new(BroadcastSink::new(STATUS_CHANNEL_CAPACITY));
        let latest = Arc::new(LatestStatusSink::new());

        let mut sinks = FanOutSink::new()
            .with(Arc::clone(&latest) as Arc<dyn StatusSink>)
            .with(Arc::clone(&updates) as Arc<dyn StatusSink>);
        if let Some(sink) = extra_sink {
            sinks = sinks.with(sink);
        }

        let poller = Poller::new(Arc::clone(&session), poller_config, Arc::new(sinks));

        Self {
            session,
            poller,
            updates,
            latest,
            poll_task: Mutex::new(None),
        }
    }

    /// Connect (retrying in the background on failure) and start polling
    pub async fn start(&self) -> bool {
        let connected = self.session.start().await;
        let mut task = self.poll_task.lock();
        if task.is_none() {
            *task = Some(self.poller.start());
        }
        connected
    }

    /// Stop polling and close the session
    pub async fn stop(&self) {
        self.session.stop().await;
        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Poller task ended abnormally: {}", e);
            }
        }
        info!("Locker service stopped");
    }

    /// Unlock one compartment and return the raw response chunk
    pub async fn unlock(&self, compartment: u8, addr: u8) -> Result<Bytes> {
        if compartment > MAX_COMPARTMENT {
            return Err(LockerError::validation(format!(
                "Compartment {} out of range 0..={}",
                compartment, MAX_COMPARTMENT
            )));
        }
        info!(
            "Unlocking compartment {} on controller {:#04X}",
            compartment, addr
        );
        self.session.try_send_unlock(compartment, addr).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    pub fn latest_status(&self, addr: u8) -> Option<LockStatus> {
        self.latest.get(addr)
    }

    pub fn statuses(&self) -> Vec<LockStatus> {
        self.latest.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<ControllerSession> {
        &self.session
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.poller.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlock_rejects_out_of_range_compartment() {
        let service = LockerService::new(&AppConfig::default());
        let err = service.unlock(12, 0x00).await.unwrap_err();
        assert!(matches!(err, LockerError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_unlock_while_disconnected() {
        let service = LockerService::new(&AppConfig::default());
        assert_eq!(
            service.unlock(MAX_COMPARTMENT, 0x00).await,
            Err(LockerError::NotConnected)
        );
        assert_eq!(service.state(), SessionState::Disconnected);
        assert!(service.statuses().is_empty());
    }
}
