//! Frame error types

use thiserror::Error;

/// Reasons a chunk is not accepted as a frame
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes yet; usually a read split across TCP segments
    #[error("Frame too short: {len} bytes, need at least {required}")]
    TooShort { len: usize, required: usize },

    /// First byte is not STX
    #[error("Missing STX: found {found:#04X}")]
    MissingStx { found: u8 },

    /// No ETX where the DATALEN field says it should be
    #[error("Missing ETX at offset {offset}")]
    MissingEtx { offset: usize },

    /// Trailing checksum does not match the frame contents
    #[error("Checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Command byte outside the supported command set
    #[error("Unknown command: {0:#04X}")]
    UnknownCommand(u8),
}

/// Result type alias for frame operations
pub type Result<T> = std::result::Result<T, FrameError>;
