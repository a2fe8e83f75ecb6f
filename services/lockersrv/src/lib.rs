//! Locker Service Library (lockersrv)
//!
//! Bridges Kerong/NCU12L locker-bank controllers to the rest of the system.
//! One long-lived TCP session per controller bus carries two kinds of traffic:
//!
//! - periodic GetStatus polls, whose replies are decoded and published to a
//!   [`StatusSink`]
//! - on-demand Unlock commands, answered with the raw response chunk
//!
//! ```text
//! ┌──────────┐  GetStatus   ┌───────────────────┐   TCP   ┌────────────┐
//! │  Poller  │─────────────►│ ControllerSession │◄───────►│ Controller │
//! └──────────┘              └───────────────────┘         └────────────┘
//!      ▲ decoded status            │ chunks
//!      └───────────────────────────┘
//!      │
//!      ▼
//! ┌──────────────┐
//! │  StatusSink  │  broadcast / latest / closures
//! └──────────────┘
//! ```
//!
//! The session reconnects on its own after any drop; callers never handle
//! transport errors beyond a `None`/`Err` result.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod poller;
pub mod reconnect;
pub mod service;
pub mod session;
pub mod simulator;
pub mod sink;

pub use config::AppConfig;
pub use error::{LockerError, Result};
pub use poller::{Poller, PollerConfig, PollerStats};
pub use reconnect::{ReconnectHelper, ReconnectPolicy};
pub use service::LockerService;
pub use session::{ControllerSession, ResponseMatching, SessionConfig, SessionState, SessionStats};
pub use simulator::BuSimulator;
pub use sink::{BroadcastSink, FanOutSink, LatestStatusSink, StatusSink, StatusUpdate};
