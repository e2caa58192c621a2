//! Frame encoder
//!
//! Builds one wire frame from (command, register id, payload): start byte,
//! escaped logical body, raw CRC trailer.

use super::command::Command;
use super::crc::CrcRegister;
use super::{FRAME_ESCAPE, FRAME_START, MAX_PAYLOAD};
use crate::error::{LinkError, Result};

/// Encode one frame.
///
/// The logical body is `cmd | len | id (big-endian) | data` with
/// `len = 4 + data.len()`; every body byte equal to the start or escape
/// token is prefixed with the escape token on the wire. The leading start
/// byte and the two trailing CRC bytes are emitted unescaped and do not
/// enter the checksum.
pub fn encode_frame(cmd: Command, id: u32, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_PAYLOAD {
        return Err(LinkError::invalid_argument(format!(
            "payload too long: {} bytes (max {})",
            data.len(),
            MAX_PAYLOAD
        )));
    }

    let mut out = Vec::with_capacity(2 * data.len() + 16);
    let mut crc = CrcRegister::new();

    out.push(FRAME_START);
    push_escaped(&mut out, &mut crc, cmd as u8);
    push_escaped(&mut out, &mut crc, (4 + data.len()) as u8);
    for byte in id.to_be_bytes() {
        push_escaped(&mut out, &mut crc, byte);
    }
    for &byte in data {
        push_escaped(&mut out, &mut crc, byte);
    }
    out.extend_from_slice(&crc.finalize().to_be_bytes());
    Ok(out)
}

#[inline]
fn push_escaped(out: &mut Vec<u8>, crc: &mut CrcRegister, byte: u8) {
    if byte == FRAME_START || byte == FRAME_ESCAPE {
        out.push(FRAME_ESCAPE);
    }
    out.push(byte);
    crc.update(byte);
}
