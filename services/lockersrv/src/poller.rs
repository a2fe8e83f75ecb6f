//! Round-robin status poller
//!
//! Every tick asks the next controller address for its lock status. Replies are
//! not correlated with requests: every chunk the session does not hand to an
//! unlock waiter is decoded and, when it parses, published with the address the
//! reply carries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kerong_protocol::hex::format_frame;
use kerong_protocol::{build_get_status, inspect_status, DecodeOptions};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::session::ControllerSession;
use crate::sink::StatusSink;

/// Poller parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Polled in order, wrapping around
    pub addresses: Vec<u8>,
    pub interval: Duration,
    pub decode: DecodeOptions,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            addresses: vec![0x00, 0x01],
            interval: Duration::from_millis(500),
            decode: DecodeOptions::default(),
        }
    }
}

/// Poller counters snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollerStats {
    pub requests_sent: u64,
    pub ticks_skipped: u64,
    pub statuses_published: u64,
    pub chunks_dropped: u64,
}

#[derive(Debug, Default)]
struct PollerCounters {
    requests_sent: AtomicU64,
    ticks_skipped: AtomicU64,
    statuses_published: AtomicU64,
    chunks_dropped: AtomicU64,
}

/// Periodic GetStatus driver feeding a [`StatusSink`]
pub struct Poller {
    session: Arc<ControllerSession>,
    config: PollerConfig,
    next_index: AtomicUsize,
    counters: Arc<PollerCounters>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("next_index", &self.next_index.load(Ordering::Relaxed))
            .finish()
    }
}

impl Poller {
    /// Create the poller and install it as the session's data callback
    pub fn new(
        session: Arc<ControllerSession>,
        config: PollerConfig,
        sink: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        let counters = Arc::new(PollerCounters::default());

        let decode = config.decode;
        let callback_counters = Arc::clone(&counters);
        session.register_data_callback(move |chunk| {
            handle_chunk(chunk, decode, sink.as_ref(), &callback_counters);
        });

        Arc::new(Self {
            session,
            config,
            next_index: AtomicUsize::new(0),
            counters,
        })
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            requests_sent: self.counters.requests_sent.load(Ordering::Relaxed),
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
            statuses_published: self.counters.statuses_published.load(Ordering::Relaxed),
            chunks_dropped: self.counters.chunks_dropped.load(Ordering::Relaxed),
        }
    }

    /// Address the next connected tick will poll
    pub fn next_address(&self) -> Option<u8> {
        let len = self.config.addresses.len();
        if len == 0 {
            return None;
        }
        Some(self.config.addresses[self.next_index.load(Ordering::Relaxed) % len])
    }

    /// Run one tick
    ///
    /// Does nothing while the session is down so the rotation resumes where it
    /// stopped. Returns the address that was asked.
    pub async fn poll_once(&self) -> Option<u8> {
        let len = self.config.addresses.len();
        if len == 0 {
            return None;
        }

        if !self.session.is_connected() {
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            trace!("Session not connected, skipping poll");
            return None;
        }
        if self.session.polling_blocked() {
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Unlock in flight, deferring poll");
            return None;
        }

        let index = self.next_index.load(Ordering::Relaxed) % len;
        let addr = self.config.addresses[index];
        let frame = build_get_status(addr);
        let written = self.session.write_frame(&frame).await;
        self.next_index.store((index + 1) % len, Ordering::Relaxed);

        match written {
            Ok(()) => {
                self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
                Some(addr)
            },
            Err(e) => {
                debug!("Status request to {:#04X} failed: {}", addr, e);
                None
            },
        }
    }

    /// Spawn the polling loop; it ends when the session is stopped
    ///
    /// The first tick fires one interval after start.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        let shutdown = self.session.shutdown_token();

        tokio::spawn(async move {
            let period = poller.config.interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "Polling {} controller(s) every {:?}",
                poller.config.addresses.len(),
                period
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        poller.poll_once().await;
                    }
                }
            }
        })
    }
}

fn handle_chunk(
    chunk: &[u8],
    decode: DecodeOptions,
    sink: &dyn StatusSink,
    counters: &PollerCounters,
) {
    match inspect_status(chunk, decode) {
        Ok(status) => {
            trace!(
                "Status from {:#04X}: mask {:#06X}",
                status.addr,
                status.bitmask()
            );
            counters.statuses_published.fetch_add(1, Ordering::Relaxed);
            sink.publish(status.addr, &status);
        },
        Err(e) => {
            counters.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropping chunk [{}]: {}", format_frame(chunk), e);
        },
    }
}
