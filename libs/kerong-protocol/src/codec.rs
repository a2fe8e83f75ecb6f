//! Kerong request frame builders
//!
//! Builds the two outbound commands the controller understands. Builders never
//! fail: out-of-range compartments are encoded bit-for-bit, the controller
//! tolerates them and callers are expected to validate beforehand.

use std::fmt;

use crate::constants::{ASK_REQUEST, CMD_OFFSET, ETX, REQUEST_FRAME_LEN, STX};
use crate::error::FrameError;
use crate::hex::format_frame;

/// Command set understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Read the hook bitmask of one unit
    GetStatus = 0x80,
    /// Release one compartment
    Unlock = 0x81,
}

impl Command {
    /// Wire value of the command byte
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(Command::GetStatus),
            0x81 => Ok(Command::Unlock),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::GetStatus => write!(f, "GetStatus"),
            Command::Unlock => write!(f, "Unlock"),
        }
    }
}

/// Unsigned 8-bit sum of `bytes`, truncated to 0xFF
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A complete, self-checksummed 8-byte request frame
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestFrame {
    bytes: [u8; REQUEST_FRAME_LEN],
    command: Command,
}

impl RequestFrame {
    fn new(addr: u8, locknum: u8, command: Command) -> Self {
        let mut bytes = [
            STX,
            addr,
            locknum,
            command.code(),
            ASK_REQUEST,
            0x00, // DATALEN: requests carry no payload
            ETX,
            0x00,
        ];
        bytes[REQUEST_FRAME_LEN - 1] = checksum(&bytes[..REQUEST_FRAME_LEN - 1]);
        Self { bytes, command }
    }

    /// Raw bytes ready for the socket
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Target controller address
    pub fn address(&self) -> u8 {
        self.bytes[1]
    }

    /// Compartment index (zero for GetStatus)
    pub fn compartment(&self) -> u8 {
        self.bytes[2]
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Trailing checksum byte
    pub fn checksum(&self) -> u8 {
        self.bytes[REQUEST_FRAME_LEN - 1]
    }
}

impl AsRef<[u8]> for RequestFrame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFrame")
            .field("command", &self.command)
            .field("bytes", &format_frame(&self.bytes))
            .finish()
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_frame(&self.bytes))
    }
}

/// Build an Unlock frame for `compartment` on controller `addr`
pub fn build_unlock(compartment: u8, addr: u8) -> RequestFrame {
    RequestFrame::new(addr, compartment, Command::Unlock)
}

/// Build a GetStatus frame for controller `addr`
pub fn build_get_status(addr: u8) -> RequestFrame {
    RequestFrame::new(addr, 0x00, Command::GetStatus)
}

/// Command byte of an inbound chunk, if it has one
pub fn peek_command(bytes: &[u8]) -> Option<u8> {
    bytes.get(CMD_OFFSET).copied()
}
