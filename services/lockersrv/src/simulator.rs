//! Locker-bank controller simulator
//!
//! A TCP server answering GetStatus and Unlock frames the way an NCU12L bus
//! unit does. Used by the integration tests and for running the service
//! without hardware.
//!
//! Replies to both commands are 10 bytes: the request header with its
//! checksum, followed by the little-endian hook bitmask of the addressed unit.
//! An unlock clears the compartment's bit before answering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use kerong_protocol::constants::{
    ADDR_OFFSET, CMD_OFFSET, ETX, HOOK_MASK, LOCKNUM_OFFSET, REQUEST_FRAME_LEN, STX,
};
use kerong_protocol::hex::format_frame;
use kerong_protocol::{checksum, Command};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Simulated bus state shared with connection handlers
#[derive(Debug, Default)]
struct BusState {
    hooks: Mutex<HashMap<u8, u16>>,
    requests: Mutex<Vec<Vec<u8>>>,
    connections: AtomicUsize,
    silent: AtomicBool,
    /// Cancelled to drop every open connection
    kick: Mutex<CancellationToken>,
}

/// In-process controller simulator
#[derive(Debug)]
pub struct BuSimulator {
    local_addr: SocketAddr,
    state: Arc<BusState>,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl BuSimulator {
    /// Listen on an ephemeral loopback port
    pub async fn start() -> Result<Self> {
        Self::bind("127.0.0.1:0").await
    }

    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(BusState::default());
        let shutdown = CancellationToken::new();

        info!("Controller simulator listening on {}", local_addr);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            state,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Set the hook bitmask reported by unit `addr`
    pub fn set_hooks(&self, addr: u8, mask: u16) {
        self.state.hooks.lock().insert(addr, mask & HOOK_MASK);
    }

    pub fn hooks(&self, addr: u8) -> u16 {
        self.state.hooks.lock().get(&addr).copied().unwrap_or(0)
    }

    /// Stop answering requests; they are still recorded
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Every complete request frame received so far
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.requests.lock().clone()
    }

    /// Addresses of the received requests carrying `command`, in arrival order
    pub fn requested_addresses(&self, command: Command) -> Vec<u8> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|frame| frame[CMD_OFFSET] == command.code())
            .map(|frame| frame[ADDR_OFFSET])
            .collect()
    }

    /// Connections accepted since start
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection from the controller side
    pub fn drop_connections(&self) {
        let previous = std::mem::take(&mut *self.state.kick.lock());
        previous.cancel();
        debug!("Simulator dropped all connections");
    }

    /// Wait until at least `count` requests arrived
    pub async fn wait_for_requests(&self, count: usize, limit: Duration) -> bool {
        self.wait_until(limit, || self.state.requests.lock().len() >= count)
            .await
    }

    /// Wait until at least `count` connections were accepted
    pub async fn wait_for_connections(&self, count: usize, limit: Duration) -> bool {
        self.wait_until(limit, || self.connection_count() >= count)
            .await
    }

    async fn wait_until(&self, limit: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop listening and close every connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.drop_connections();
    }
}

impl Drop for BuSimulator {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.state.kick.lock().cancel();
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BusState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                state.connections.fetch_add(1, Ordering::SeqCst);
                debug!("Simulator accepted {}", peer);
                let kick = state.kick.lock().clone();
                tokio::spawn(handle_connection(stream, Arc::clone(&state), kick));
            },
            Err(e) => {
                warn!("Simulator accept failed: {}", e);
            },
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<BusState>, kick: CancellationToken) {
    let mut pending = BytesMut::with_capacity(64);

    loop {
        let read = tokio::select! {
            _ = kick.cancelled() => break,
            read = stream.read_buf(&mut pending) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {},
            Err(e) => {
                debug!("Simulator read error: {}", e);
                break;
            },
        }

        while pending.len() >= REQUEST_FRAME_LEN {
            // Resynchronise on STX if the stream carries garbage
            if pending[0] != STX {
                pending.advance(1);
                continue;
            }
            let frame = pending.split_to(REQUEST_FRAME_LEN).to_vec();
            debug!("Simulator RX [{}]", format_frame(&frame));
            let reply = respond(&state, &frame);
            state.requests.lock().push(frame);

            if let Some(reply) = reply {
                if let Err(e) = stream.write_all(&reply).await {
                    debug!("Simulator write error: {}", e);
                    return;
                }
            }
        }
    }
}

/// Build the reply for one request frame, applying unlocks to the bus state
fn respond(state: &BusState, frame: &[u8]) -> Option<Vec<u8>> {
    if state.silent.load(Ordering::SeqCst) {
        return None;
    }

    let addr = frame[ADDR_OFFSET];
    let compartment = frame[LOCKNUM_OFFSET];
    let mask = {
        let mut hooks = state.hooks.lock();
        let mask = hooks.entry(addr).or_insert(0);
        match Command::try_from(frame[CMD_OFFSET]) {
            Ok(Command::Unlock) => {
                if let Some(bit) = 1u16.checked_shl(u32::from(compartment)) {
                    *mask &= !bit;
                }
            },
            Ok(Command::GetStatus) => {},
            Err(_) => return None,
        }
        *mask
    };

    let mut reply = vec![STX, addr, compartment, frame[CMD_OFFSET], 0x00, 0x00, ETX];
    reply.push(checksum(&reply));
    reply.extend_from_slice(&mask.to_le_bytes());
    Some(reply)
}
