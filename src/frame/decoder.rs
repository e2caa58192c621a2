//! Frame decoder
//!
//! Incremental decoder over an externally owned, append-only byte buffer.
//! Each call attempts to parse exactly one frame starting at the first
//! unambiguous frame start; the caller owns the buffer and slices off the
//! reported consumed/discard counts, so the transport layer stays in
//! control of buffering.

use super::command::{Command, Datagram};
use super::crc::CrcRegister;
use super::{FRAME_ESCAPE, FRAME_START};
use crate::error::LinkError;

/// Outcome of one decode attempt
#[derive(Debug)]
pub enum DecodeStep {
    /// A complete frame was parsed; `consumed` raw bytes (including any
    /// skipped garbage prefix) should be sliced off the buffer head
    Frame { datagram: Datagram, consumed: usize },
    /// The buffer does not yet hold a complete frame
    NeedMoreData,
    /// Recoverable corruption; drop `discard` bytes from the buffer head,
    /// then scanning may resume
    Corrupt { error: LinkError, discard: usize },
}

/// Attempt to parse one frame from the head of `buf`.
pub fn decode(buf: &[u8]) -> DecodeStep {
    let mut from = 0;
    loop {
        let Some(start) = find_frame_start(buf, from) else {
            return DecodeStep::NeedMoreData;
        };
        match parse_at(buf, start) {
            Parse::Frame(datagram, consumed) => {
                return DecodeStep::Frame {
                    datagram,
                    consumed,
                }
            },
            Parse::NeedMore => return DecodeStep::NeedMoreData,
            // Garbage frame (unknown command code): resume scanning after
            // the start byte without surfacing an error.
            Parse::Garbage => from = start + 1,
            Parse::Corrupt(error, discard) => return DecodeStep::Corrupt { error, discard },
        }
    }
}

/// Find the next start token that is not preceded by an escape token.
fn find_frame_start(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len()).find(|&i| buf[i] == FRAME_START && (i == 0 || buf[i - 1] != FRAME_ESCAPE))
}

enum Parse {
    Frame(Datagram, usize),
    NeedMore,
    Garbage,
    Corrupt(LinkError, usize),
}

fn parse_at(buf: &[u8], start: usize) -> Parse {
    let mut cursor = Unescaper::new(buf, start + 1);
    let mut crc = CrcRegister::new();

    let cmd_byte = match cursor.next_byte() {
        Logical::Byte(b) => b,
        Logical::NeedMore => return Parse::NeedMore,
        Logical::Boundary(_) => return Parse::Garbage,
    };
    let Some(cmd) = Command::from_byte(cmd_byte) else {
        return Parse::Garbage;
    };
    crc.update(cmd_byte);

    let len = match cursor.next_byte() {
        Logical::Byte(b) => b as usize,
        Logical::NeedMore => return Parse::NeedMore,
        Logical::Boundary(next) => {
            return Parse::Corrupt(LinkError::frame("truncated frame header"), next)
        },
    };
    if len < 4 {
        // Heartbeat-style runt frame: no room for a register id.
        return Parse::Corrupt(
            LinkError::frame(format!("short frame: len={len}")),
            start + 1,
        );
    }
    crc.update(len as u8);

    // id (4 bytes big-endian) followed by len - 4 payload bytes
    let mut body = Vec::with_capacity(len);
    for _ in 0..len {
        match cursor.next_byte() {
            Logical::Byte(b) => {
                crc.update(b);
                body.push(b);
            },
            Logical::NeedMore => return Parse::NeedMore,
            Logical::Boundary(next) => {
                return Parse::Corrupt(LinkError::frame("truncated frame body"), next)
            },
        }
    }

    // CRC trailer: two raw bytes, emitted unescaped by the encoder.
    let crc_pos = cursor.pos();
    if buf.len() < crc_pos + 2 {
        return Parse::NeedMore;
    }
    let received = u16::from_be_bytes([buf[crc_pos], buf[crc_pos + 1]]);
    let computed = crc.finalize();
    if computed != received {
        return Parse::Corrupt(LinkError::Crc { computed, received }, start + 1);
    }

    let id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let data = body[4..].to_vec();
    Parse::Frame(Datagram::new(cmd, id, data), crc_pos + 2)
}

/// Collapses escape sequences in the logical frame body.
struct Unescaper<'a> {
    buf: &'a [u8],
    pos: usize,
}

enum Logical {
    /// One logical byte
    Byte(u8),
    /// Buffer exhausted mid-body
    NeedMore,
    /// Unescaped start token at the given raw index: the next frame begins
    Boundary(usize),
}

impl<'a> Unescaper<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn next_byte(&mut self) -> Logical {
        let Some(&b) = self.buf.get(self.pos) else {
            return Logical::NeedMore;
        };
        if b == FRAME_START {
            return Logical::Boundary(self.pos);
        }
        if b == FRAME_ESCAPE {
            let Some(&literal) = self.buf.get(self.pos + 1) else {
                return Logical::NeedMore;
            };
            self.pos += 2;
            return Logical::Byte(literal);
        }
        self.pos += 1;
        Logical::Byte(b)
    }

    /// Current raw position in the buffer
    fn pos(&self) -> usize {
        self.pos
    }
}
