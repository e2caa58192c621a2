//! Wire frame codec
//!
//! The inverter speaks a byte-stuffed, CRC-protected framing format over a
//! plain byte stream:
//!
//! ```text
//! 0x2B | ESC(cmd) | ESC(len) | ESC(id[31:24] .. id[7:0]) | ESC(data...) | CRC_HI | CRC_LO
//! ```
//!
//! - The start token `0x2B` opens every frame and is never escaped.
//! - `ESC(b)` prefixes `0x2D` when `b` is the start or escape token; only
//!   the literal byte enters the checksum.
//! - `len = 4 + data.len()`; the id is big-endian.
//! - The 16-bit CRC trailer is big-endian, emitted raw, and covers the
//!   logical `cmd | len | id | data` bytes with a zero pad folded in for
//!   odd-length input.

mod command;
mod crc;
mod decoder;
mod encoder;

pub use command::{Command, Datagram};
pub use crc::{crc16, CrcRegister};
pub use decoder::{decode, DecodeStep};
pub use encoder::encode_frame;

/// Start-of-frame token
pub const FRAME_START: u8 = 0x2B;

/// Escape token
pub const FRAME_ESCAPE: u8 = 0x2D;

/// Maximum payload bytes in a short-length frame (`len` fits one byte and
/// counts the 4-byte id)
pub const MAX_PAYLOAD: usize = 251;
