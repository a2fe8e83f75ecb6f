//! Status sinks
//!
//! Decoded statuses leave the core through a [`StatusSink`]. The poller never
//! waits on a sink; implementations must return quickly.

use std::collections::HashMap;
use std::sync::Arc;

use kerong_protocol::LockStatus;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Consumer of decoded status updates
pub trait StatusSink: Send + Sync {
    /// Deliver one update; `addr` is the controller address reported in the response
    fn publish(&self, addr: u8, status: &LockStatus);
}

impl<F> StatusSink for F
where
    F: Fn(u8, &LockStatus) + Send + Sync,
{
    fn publish(&self, addr: u8, status: &LockStatus) {
        self(addr, status)
    }
}

/// One published status, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub addr: u8,
    pub status: LockStatus,
}

/// Fan-out of updates to any number of async subscribers
///
/// Slow subscribers lag and lose the oldest updates instead of blocking the poller.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<StatusUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StatusSink for BroadcastSink {
    fn publish(&self, addr: u8, status: &LockStatus) {
        let update = StatusUpdate {
            addr,
            status: *status,
        };
        if self.tx.send(update).is_err() {
            trace!("No subscribers for status of {:#04X}", addr);
        }
    }
}

/// Last known status per controller address
#[derive(Debug, Default)]
pub struct LatestStatusSink {
    latest: RwLock<HashMap<u8, LockStatus>>,
}

impl LatestStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: u8) -> Option<LockStatus> {
        self.latest.read().get(&addr).copied()
    }

    /// All known statuses ordered by address
    pub fn snapshot(&self) -> Vec<LockStatus> {
        let mut statuses: Vec<LockStatus> = self.latest.read().values().copied().collect();
        statuses.sort_by_key(|status| status.addr);
        statuses
    }
}

impl StatusSink for LatestStatusSink {
    fn publish(&self, addr: u8, status: &LockStatus) {
        self.latest.write().insert(addr, *status);
    }
}

/// Delivers every update to each inner sink in order
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanOutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StatusSink for FanOutSink {
    fn publish(&self, addr: u8, status: &LockStatus) {
        for sink in &self.sinks {
            sink.publish(addr, status);
        }
    }
}
