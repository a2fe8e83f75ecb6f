//! Controller session
//!
//! Owns the single TCP connection to the locker-bank controller. The session
//! object lives for the whole process and keeps its identity across reconnects;
//! only the socket underneath is replaced.
//!
//! # Response correlation
//!
//! The controller protocol has no request IDs and the socket carries both poll
//! replies and on-demand replies. In [`ResponseMatching::NextChunk`] mode (the
//! default) an unlock request resolves with whatever chunk arrives next, which
//! may be a poll reply that was already in flight. This ordering weakness is
//! known and accepted. The waiter is queued before the request is written, so
//! a chunk landing while the write is still in progress already counts as the
//! response.
//! [`ResponseMatching::Exclusive`] narrows it: only one
//! unlock is outstanding at a time, the poller holds off while it is, and only
//! a chunk carrying an Unlock echo resolves the waiter. Poll bytes coalesced
//! ahead of the echo are split off and go to the data callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kerong_protocol::constants::{MIN_STATUS_FRAME_LEN, STX};
use kerong_protocol::hex::format_frame;
use kerong_protocol::{build_unlock, peek_command, Command, RequestFrame};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{LockerError, Result};
use crate::reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};

/// Read buffer reserved per socket read
pub const READ_BUFFER_SIZE: usize = 1024;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How inbound chunks are matched to on-demand requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMatching {
    /// The next chunk after the write answers the oldest pending request
    #[default]
    NextChunk,
    /// One request at a time, polling deferred, only Unlock echoes resolve it
    Exclusive,
}

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// `None` waits for an unlock response indefinitely
    pub unlock_timeout: Option<Duration>,
    pub response_matching: ResponseMatching,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4001,
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            unlock_timeout: None,
            response_matching: ResponseMatching::NextChunk,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

/// Receiver of chunks not claimed by an on-demand request
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Session counters snapshot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub frames_written: u64,
    pub chunks_received: u64,
}

#[derive(Debug, Default)]
struct SessionCounters {
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    frames_written: AtomicU64,
    chunks_received: AtomicU64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Bytes>,
}

/// Resilient connection to one controller
pub struct ControllerSession {
    config: SessionConfig,
    /// Endpoint of the last successful connect, reused by the reconnect loop
    endpoint: parking_lot::Mutex<(String, u16)>,
    state_tx: watch::Sender<SessionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Bumped on every successful connect; readers of older sockets are ignored
    generation: AtomicU64,
    /// Cancels the reader of the live socket
    conn_token: parking_lot::Mutex<CancellationToken>,
    waiters: parking_lot::Mutex<VecDeque<Waiter>>,
    next_waiter_id: AtomicU64,
    data_callback: parking_lot::RwLock<Option<DataCallback>>,
    request_gate: Arc<Mutex<()>>,
    /// Set while a reconnect loop owns recovery of the link
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
    counters: SessionCounters,
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("endpoint", &*self.endpoint.lock())
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

impl ControllerSession {
    /// Create a disconnected session; call [`start`](Self::start) to bring it up
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let endpoint = (config.host.clone(), config.port);
        Arc::new(Self {
            config,
            endpoint: parking_lot::Mutex::new(endpoint),
            state_tx,
            writer: Mutex::new(None),
            generation: AtomicU64::new(0),
            conn_token: parking_lot::Mutex::new(CancellationToken::new()),
            waiters: parking_lot::Mutex::new(VecDeque::new()),
            next_waiter_id: AtomicU64::new(0),
            data_callback: parking_lot::RwLock::new(None),
            request_gate: Arc::new(Mutex::new(())),
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            counters: SessionCounters::default(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Token cancelled by [`stop`](Self::stop); background tasks tied to the session use it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connects: self.counters.connects.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
            frames_written: self.counters.frames_written.load(Ordering::Relaxed),
            chunks_received: self.counters.chunks_received.load(Ordering::Relaxed),
        }
    }

    /// Number of on-demand requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether a background reconnect loop is running
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Whether the poller should hold off this tick
    pub fn polling_blocked(&self) -> bool {
        self.config.response_matching == ResponseMatching::Exclusive
            && self.request_gate.try_lock().is_err()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Session state {:?} -> {:?}", previous, state);
        }
    }

    /// Bring the session up on the configured endpoint
    ///
    /// A failed first attempt is not an error: the reconnect loop keeps trying
    /// in the background.
    pub async fn start(self: &Arc<Self>) -> bool {
        let host = self.config.host.clone();
        let port = self.config.port;
        info!("Starting controller session for {}:{}", host, port);

        let connected = self.connect(&host, port).await;
        if !connected {
            warn!(
                "Initial connection to {}:{} failed, retrying in background",
                host, port
            );
            self.schedule_reconnect();
        }
        connected
    }

    /// Stop the session for good: cancel the reader and reconnect loop, drop the socket
    pub async fn stop(&self) {
        info!("Stopping controller session");
        self.shutdown.cancel();
        self.writer.lock().await.take();
        let released = self.release_waiters();
        if released > 0 {
            debug!("Released {} pending request(s) on stop", released);
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Make one connection attempt
    ///
    /// Returns `true` once the TCP connect completes. On success the session
    /// accepts writes and delivers inbound data; the endpoint is remembered for
    /// later reconnects. A failed attempt leaves an existing connection in place.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> bool {
        match self.try_connect(host, port).await {
            Ok(()) => true,
            Err(LockerError::NotConnected) => {
                debug!("Session stopped, ignoring connect to {}:{}", host, port);
                false
            },
            Err(e) => {
                warn!("{}", e);
                false
            },
        }
    }

    /// [`connect`](Self::connect) with the failure reason
    ///
    /// Fails with `NotConnected` once the session is stopped.
    pub async fn try_connect(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(LockerError::NotConnected);
        }

        let was_connected = self.writer.lock().await.is_some();
        if !was_connected {
            self.set_state(SessionState::Connecting);
        }

        let addr = format!("{}:{}", host, port);
        debug!("Connecting to controller {}", addr);

        let failure = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => return self.attach(stream, host, port).await,
            Ok(Err(e)) => LockerError::connection(format!("Failed to connect to {}: {}", addr, e)),
            Err(_) => LockerError::timeout(format!("Connection to {} timed out", addr)),
        };

        // The live socket, if any, survives a failed attempt
        let still_connected = self.writer.lock().await.is_some();
        self.set_state(if still_connected {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        });
        Err(failure)
    }

    /// Install a freshly connected stream as the live socket
    async fn attach(self: &Arc<Self>, stream: TcpStream, host: &str, port: u16) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let token = self.shutdown.child_token();
        let generation = {
            let mut writer_slot = self.writer.lock().await;
            if self.shutdown.is_cancelled() {
                self.set_state(SessionState::Disconnected);
                return Err(LockerError::NotConnected);
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = std::mem::replace(&mut *self.conn_token.lock(), token.clone());
            previous.cancel();
            *writer_slot = Some(writer);
            *self.endpoint.lock() = (host.to_string(), port);
            generation
        };

        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        self.set_state(SessionState::Connected);
        info!("Connected to controller {}:{}", host, port);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.read_loop(reader, generation, token).await;
        });

        Ok(())
    }

    /// Register the receiver for unsolicited inbound data, replacing any previous one
    pub fn register_data_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut slot = self.data_callback.write();
        if slot.is_some() {
            debug!("Replacing session data callback");
        }
        *slot = Some(Arc::new(callback));
    }

    /// Write one frame to the controller
    pub async fn write_frame(&self, frame: &RequestFrame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(LockerError::NotConnected);
        };

        match stream.write_all(frame.as_bytes()).await {
            Ok(()) => {
                self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                debug!("TX {} [{}]", frame.command(), frame);
                Ok(())
            },
            Err(e) => {
                // Tear the socket down; the reader notices and schedules a reconnect
                writer.take();
                self.conn_token.lock().cancel();
                Err(LockerError::io(format!(
                    "Failed to write {} frame: {}",
                    frame.command(),
                    e
                )))
            },
        }
    }

    /// Send an Unlock and wait for the response chunk
    ///
    /// Returns `None` without touching the socket when not connected, and
    /// `None` when the write fails, the configured timeout expires or the link
    /// drops first. See the module docs for the correlation caveat.
    pub async fn send_unlock(&self, compartment: u8, addr: u8) -> Option<Bytes> {
        match self.try_send_unlock(compartment, addr).await {
            Ok(response) => Some(response),
            Err(LockerError::NotConnected) => {
                debug!(
                    "Unlock of compartment {} on controller {:#04X} skipped: not connected",
                    compartment, addr
                );
                None
            },
            Err(e) if e.is_transport() => {
                warn!(
                    "Unlock of compartment {} on controller {:#04X} failed: {}",
                    compartment, addr, e
                );
                None
            },
            Err(e) => {
                error!(
                    "Unlock of compartment {} on controller {:#04X} rejected: {}",
                    compartment, addr, e
                );
                None
            },
        }
    }

    /// [`send_unlock`](Self::send_unlock) with the failure reason
    ///
    /// The waiter is queued before the frame is written; see the module docs.
    pub async fn try_send_unlock(&self, compartment: u8, addr: u8) -> Result<Bytes> {
        if !self.is_connected() {
            return Err(LockerError::NotConnected);
        }

        let _gate = match self.config.response_matching {
            ResponseMatching::Exclusive => Some(Arc::clone(&self.request_gate).lock_owned().await),
            ResponseMatching::NextChunk => None,
        };

        let frame = build_unlock(compartment, addr);
        let (id, rx) = self.register_waiter();
        if let Err(e) = self.write_frame(&frame).await {
            self.remove_waiter(id);
            return Err(e);
        }

        let response = match self.config.unlock_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(response) => response,
                Err(_) => {
                    self.remove_waiter(id);
                    return Err(LockerError::timeout(format!(
                        "No unlock response from controller {:#04X} within {:?}",
                        addr, limit
                    )));
                },
            },
            None => rx.await,
        };

        response.map_err(|_| LockerError::ResponseDropped)
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<Bytes>) {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(Waiter { id, tx });
        (id, rx)
    }

    fn remove_waiter(&self, id: u64) {
        self.waiters.lock().retain(|waiter| waiter.id != id);
    }

    /// Drop every pending waiter; their callers resolve with `None`
    fn release_waiters(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let released = waiters.len();
        waiters.clear();
        released
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        generation: u64,
        token: CancellationToken,
    ) {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reader for connection #{} cancelled", generation);
                    break;
                }
                result = reader.read_buf(&mut buffer) => result,
            };

            match result {
                Ok(0) => {
                    info!("Controller closed the connection");
                    break;
                },
                Ok(n) => {
                    trace!("Received {} bytes", n);
                    let chunk = buffer.split().freeze();
                    self.dispatch(chunk);
                    buffer.reserve(READ_BUFFER_SIZE);
                },
                Err(e) => {
                    warn!("Controller socket error: {}", e);
                    break;
                },
            }
        }

        self.handle_close(generation).await;
    }

    /// Route one inbound chunk to a pending request or the data callback
    fn dispatch(&self, mut chunk: Bytes) {
        self.counters.chunks_received.fetch_add(1, Ordering::Relaxed);
        debug!("RX [{}]", format_frame(&chunk));

        let mut leading = None;
        let waiter = {
            let mut waiters = self.waiters.lock();
            match self.config.response_matching {
                ResponseMatching::NextChunk => waiters.pop_front(),
                ResponseMatching::Exclusive => match find_unlock_echo(&chunk) {
                    Some(offset) if !waiters.is_empty() => {
                        // Poll replies coalesced ahead of the echo still go to the callback
                        if offset > 0 {
                            leading = Some(chunk.split_to(offset));
                        }
                        waiters.pop_front()
                    },
                    _ => None,
                },
            }
        };

        if let Some(leading) = leading {
            self.forward(&leading);
        }

        match waiter {
            Some(waiter) => {
                if let Err(chunk) = waiter.tx.send(chunk) {
                    // Caller gave up between the pop and the send
                    self.forward(&chunk);
                }
            },
            None => self.forward(&chunk),
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_chunk(&self, chunk: &[u8]) {
        self.dispatch(Bytes::copy_from_slice(chunk));
    }

    fn forward(&self, chunk: &[u8]) {
        let callback = self.data_callback.read().clone();
        match callback {
            Some(callback) => callback(chunk),
            None => trace!("No data callback registered, dropping {} bytes", chunk.len()),
        }
    }

    async fn handle_close(self: &Arc<Self>, generation: u64) {
        {
            let mut writer = self.writer.lock().await;
            if generation != self.generation.load(Ordering::SeqCst) {
                // A newer socket already replaced this one
                return;
            }
            writer.take();
        }

        self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        self.set_state(SessionState::Disconnected);

        let released = self.release_waiters();
        if released > 0 {
            debug!("Released {} pending request(s) after disconnect", released);
        }

        if self.shutdown.is_cancelled() {
            return;
        }
        self.schedule_reconnect();
    }

    /// Spawn the reconnect loop unless one is already running
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect loop already running");
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let mut helper = ReconnectHelper::new(self.config.reconnect.clone());
        let (host, port) = self.endpoint.lock().clone();
        info!(
            "Reconnecting to {}:{} in {:?}",
            host,
            port,
            helper.calculate_next_delay()
        );

        loop {
            let attempt = helper.execute_reconnect(|| {
                let session = Arc::clone(self);
                async move {
                    if session.is_connected() {
                        // Someone else brought the link back meanwhile
                        return Ok(());
                    }
                    // Read per attempt: an explicit connect may have moved the endpoint
                    let (host, port) = session.endpoint.lock().clone();
                    session
                        .counters
                        .reconnect_attempts
                        .fetch_add(1, Ordering::Relaxed);
                    session.try_connect(&host, port).await
                }
            });

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Reconnect loop cancelled");
                    break;
                }
                result = attempt => result,
            };

            match result {
                Ok(()) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    // A close that raced the flag found it set and left recovery to us
                    if self.is_connected()
                        || self.shutdown.is_cancelled()
                        || self.reconnecting.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                    debug!("Link dropped again before the reconnect loop finished");
                },
                Err(ReconnectError::MaxAttemptsExceeded(attempts)) => {
                    let (host, port) = self.endpoint.lock().clone();
                    error!(
                        "Giving up on {}:{} after {} attempts",
                        host, port, attempts
                    );
                    break;
                },
                Err(ReconnectError::ConnectionFailed(_)) => continue,
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

/// Offset of the Unlock echo among the reply frames of `chunk`
///
/// Only frame starts are inspected: status replies ahead of the echo are
/// skipped whole, so hook mask bytes never pose as a header.
fn find_unlock_echo(chunk: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while offset < chunk.len() {
        if chunk[offset] != STX {
            return None;
        }
        match peek_command(&chunk[offset..]) {
            Some(code) if code == Command::Unlock.code() => return Some(offset),
            Some(code) if code == Command::GetStatus.code() => offset += MIN_STATUS_FRAME_LEN,
            _ => return None,
        }
    }
    None
}
