//! Status response decoding
//!
//! A status response carries the responding unit's address at offset 1 and the
//! hook bitmask in its last two bytes (little-endian, bit i set means hook i is
//! locked). Chunks shorter than [`MIN_STATUS_FRAME_LEN`] are not errors: reads
//! split across TCP segments are expected and are simply ignored.
//!
//! Inbound checksums are not verified unless [`DecodeOptions::verify_checksum`]
//! is set; the controller is trusted by default.

use serde::{Deserialize, Serialize};

use crate::codec::checksum;
use crate::constants::{
    ADDR_OFFSET, DATALEN_OFFSET, ETX, HOOK_COUNT, HOOK_MASK, MIN_STATUS_FRAME_LEN, STX,
};
use crate::error::{FrameError, Result};

/// State of a single lock hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Locked,
    Unlocked,
}

impl LockState {
    pub fn is_locked(self) -> bool {
        matches!(self, LockState::Locked)
    }
}

/// Decoded lock map of one controller unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// Address of the unit that answered
    pub addr: u8,
    /// Hook states indexed by compartment
    pub hooks: [LockState; HOOK_COUNT],
}

impl LockStatus {
    /// Build a snapshot from the raw 16-bit status word; bits above 11 are ignored
    pub fn from_bitmask(addr: u8, mask: u16) -> Self {
        let mut hooks = [LockState::Unlocked; HOOK_COUNT];
        for (i, hook) in hooks.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *hook = LockState::Locked;
            }
        }
        Self { addr, hooks }
    }

    /// State of `compartment`, `None` when out of range
    pub fn state(&self, compartment: usize) -> Option<LockState> {
        self.hooks.get(compartment).copied()
    }

    pub fn is_locked(&self, compartment: usize) -> bool {
        self.state(compartment).is_some_and(LockState::is_locked)
    }

    /// `(compartment, state)` pairs in compartment order
    pub fn iter(&self) -> impl Iterator<Item = (usize, LockState)> + '_ {
        self.hooks.iter().copied().enumerate()
    }

    pub fn locked_count(&self) -> usize {
        self.hooks.iter().filter(|h| h.is_locked()).count()
    }

    /// Re-encode the hook states as a 12-bit mask
    pub fn bitmask(&self) -> u16 {
        self.iter()
            .filter(|(_, state)| state.is_locked())
            .fold(0u16, |mask, (i, _)| mask | (1 << i))
            & HOOK_MASK
    }
}

/// Decoder switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Reject frames whose header checksum does not match
    pub verify_checksum: bool,
}

impl DecodeOptions {
    pub fn strict() -> Self {
        Self {
            verify_checksum: true,
        }
    }
}

/// Decode a status response, or explain why the chunk was not accepted
pub fn inspect_status(bytes: &[u8], options: DecodeOptions) -> Result<LockStatus> {
    let len = bytes.len();
    if len < MIN_STATUS_FRAME_LEN {
        return Err(FrameError::TooShort {
            len,
            required: MIN_STATUS_FRAME_LEN,
        });
    }

    if options.verify_checksum {
        verify_header_checksum(bytes)?;
    }

    let mask = u16::from_le_bytes([bytes[len - 2], bytes[len - 1]]);
    Ok(LockStatus::from_bitmask(bytes[ADDR_OFFSET], mask))
}

/// Decode a status response with default (trusting) options
///
/// Returns `None` for anything shorter than 10 bytes.
pub fn decode_status(bytes: &[u8]) -> Option<LockStatus> {
    decode_status_with(bytes, DecodeOptions::default())
}

pub fn decode_status_with(bytes: &[u8], options: DecodeOptions) -> Option<LockStatus> {
    inspect_status(bytes, options).ok()
}

/// Check STX, the ETX declared by DATALEN and the checksum byte that follows it
fn verify_header_checksum(bytes: &[u8]) -> Result<()> {
    if bytes[0] != STX {
        return Err(FrameError::MissingStx { found: bytes[0] });
    }

    let etx_offset = DATALEN_OFFSET + 1 + bytes[DATALEN_OFFSET] as usize;
    let sum_offset = etx_offset + 1;
    if sum_offset >= bytes.len() {
        return Err(FrameError::TooShort {
            len: bytes.len(),
            required: sum_offset + 1,
        });
    }
    if bytes[etx_offset] != ETX {
        return Err(FrameError::MissingEtx { offset: etx_offset });
    }

    let expected = checksum(&bytes[..sum_offset]);
    let actual = bytes[sum_offset];
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}
