//! Kerong/NCU12L locker-bank controller protocol
//!
//! Pure frame codec, no I/O:
//! - [`build_get_status`] / [`build_unlock`] produce 8-byte request frames
//! - [`decode_status`] turns a status response into a [`LockStatus`]
//!
//! ```
//! use kerong_protocol::{build_unlock, decode_status};
//!
//! let frame = build_unlock(3, 0x00);
//! assert_eq!(frame.as_bytes(), &[0x02, 0x00, 0x03, 0x81, 0x00, 0x00, 0x03, 0x89]);
//!
//! // Partial reads are ignored rather than rejected
//! assert!(decode_status(&[0x02, 0x00, 0x00]).is_none());
//! ```

pub mod codec;
pub mod constants;
pub mod error;
pub mod hex;
pub mod status;

pub use codec::{build_get_status, build_unlock, checksum, peek_command, Command, RequestFrame};
pub use error::FrameError;
pub use status::{
    decode_status, decode_status_with, inspect_status, DecodeOptions, LockState, LockStatus,
};
