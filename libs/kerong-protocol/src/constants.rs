//! Kerong protocol constants
//!
//! Frame layout shared by requests and responses:
//! `[STX, ADDR, LOCKNUM, CMD, ASK, DATALEN, ..payload.., ETX, CHECKSUM]`

// ============================================================================
// Frame Markers
// ============================================================================

/// Start-of-text marker, always the first byte of a frame
pub const STX: u8 = 0x02;

/// End-of-text marker, always directly before the checksum byte
pub const ETX: u8 = 0x03;

/// ASK value carried by every outbound request (acknowledgements use other values)
pub const ASK_REQUEST: u8 = 0x00;

// ============================================================================
// Field Offsets
// ============================================================================

/// Offset of the controller address byte
pub const ADDR_OFFSET: usize = 1;

/// Offset of the compartment (lock hook) byte
pub const LOCKNUM_OFFSET: usize = 2;

/// Offset of the command byte
pub const CMD_OFFSET: usize = 3;

/// Offset of the ASK byte
pub const ASK_OFFSET: usize = 4;

/// Offset of the payload length byte
pub const DATALEN_OFFSET: usize = 5;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Length of every request frame this crate builds
///
/// STX(1) + ADDR(1) + LOCKNUM(1) + CMD(1) + ASK(1) + DATALEN(1) + ETX(1) + CHECKSUM(1) = 8
pub const REQUEST_FRAME_LEN: usize = 8;

/// Shortest chunk that is treated as a status response
///
/// Header (6) + ETX (1) + CHECKSUM (1) + hook bitmask (2) = 10. Anything shorter is
/// assumed to be a partial read and ignored.
pub const MIN_STATUS_FRAME_LEN: usize = 10;

/// Number of lock hooks (compartments) per controller unit
pub const HOOK_COUNT: usize = 12;

/// Mask selecting the hook bits out of the 16-bit status word
pub const HOOK_MASK: u16 = (1 << HOOK_COUNT) - 1;

/// Highest valid compartment index
pub const MAX_COMPARTMENT: u8 = (HOOK_COUNT - 1) as u8;
