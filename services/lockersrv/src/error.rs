//! Error handling for the locker service
//!
//! Transport failures are never fatal: they surface to the operation that hit
//! them and the session's reconnect loop takes care of recovery.

use thiserror::Error;

/// Locker Service Error Type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection establishment errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation attempted without a live connection
    #[error("Not connected to controller")]
    NotConnected,

    /// Socket read/write errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Frame-level errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Caller-supplied arguments out of range
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Waiter released without a response (connection dropped or session stopped)
    #[error("Response dropped before it arrived")]
    ResponseDropped,
}

/// Result type alias for the locker service
pub type Result<T> = std::result::Result<T, LockerError>;

impl LockerError {
    pub fn config(msg: impl Into<String>) -> Self {
        LockerError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LockerError::ConnectionError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LockerError::IoError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LockerError::TimeoutError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        LockerError::ValidationError(msg.into())
    }

    /// Whether the error comes from the link rather than from the caller or config
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LockerError::ConnectionError(_)
                | LockerError::IoError(_)
                | LockerError::TimeoutError(_)
                | LockerError::ResponseDropped
        )
    }
}

impl From<std::io::Error> for LockerError {
    fn from(err: std::io::Error) -> Self {
        LockerError::IoError(err.to_string())
    }
}

impl From<figment::Error> for LockerError {
    fn from(err: figment::Error) -> Self {
        LockerError::ConfigError(err.to_string())
    }
}

impl From<kerong_protocol::FrameError> for LockerError {
    fn from(err: kerong_protocol::FrameError) -> Self {
        LockerError::ProtocolError(err.to_string())
    }
}
