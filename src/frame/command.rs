//! Protocol commands and datagrams
//!
//! A datagram is one logical protocol message: (command, register id, data).

use crate::error::Result;

/// Protocol command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Read a register
    Read = 0x01,
    /// Write a register
    Write = 0x02,
    /// Write a register (long form)
    LongWrite = 0x03,
    /// Reserved
    Reserved1 = 0x04,
    /// Response to a read or write
    Response = 0x05,
    /// Response (long form)
    LongResponse = 0x06,
    /// Reserved
    Reserved2 = 0x07,
    /// Subscribe to periodic reads
    ReadPeriodically = 0x08,
    /// Protocol extension
    Extension = 0x3C,
}

impl Command {
    /// Decode a command byte, returning `None` for codes outside the command set.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Read),
            0x02 => Some(Command::Write),
            0x03 => Some(Command::LongWrite),
            0x04 => Some(Command::Reserved1),
            0x05 => Some(Command::Response),
            0x06 => Some(Command::LongResponse),
            0x07 => Some(Command::Reserved2),
            0x08 => Some(Command::ReadPeriodically),
            0x3C => Some(Command::Extension),
            _ => None,
        }
    }

    /// Check if this command carries response data
    pub fn is_response(self) -> bool {
        matches!(self, Command::Response | Command::LongResponse)
    }
}

/// One logical protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Command code
    pub cmd: Command,
    /// Register identifier
    pub id: u32,
    /// Payload bytes (at most [`super::MAX_PAYLOAD`])
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(cmd: Command, id: u32, data: Vec<u8>) -> Self {
        Self { cmd, id, data }
    }

    /// Encode this datagram into a wire frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        super::encoder::encode_frame(self.cmd, self.id, &self.data)
    }
}
