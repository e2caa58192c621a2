//! Register descriptors and value codec
//!
//! The register catalog is table-driven configuration: each descriptor
//! carries a wire-type tag, a writable flag and an optional validation
//! predicate, and the client selects codec behavior by tag. A built-in
//! table of well-known registers is provided; callers may supply their own
//! tables (for example deserialized from JSON) and pass descriptors
//! directly to [`crate::Connection::query`] / [`crate::Connection::write`].

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::frame::MAX_PAYLOAD;

/// Well-known id of the battery state-of-charge register (float32, 0..1)
pub const ID_BATTERY_SOC: u32 = 0x400F_015B;

/// Well-known id of the battery status register (0 = normal operation)
pub const ID_BATTERY_STATUS: u32 = 0x70A2_AF4F;

/// Well-known id of the grid frequency register
pub const ID_GRID_FREQUENCY: u32 = 0xDB2D_69AE;

/// On-wire representation of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    /// IEEE-754 single, big-endian
    Float32,
    /// Single unsigned byte
    Uint8,
    /// Unsigned 16-bit, big-endian
    Uint16,
    /// Unsigned 32-bit, big-endian
    Uint32,
    /// Enumerated value in one byte
    EnumU8,
    /// ASCII text, NUL-padded on the device side
    StringAscii,
}

impl WireType {
    /// Fixed payload length for this wire type, `None` for variable-length
    pub fn payload_len(self) -> Option<usize> {
        match self {
            WireType::Float32 | WireType::Uint32 => Some(4),
            WireType::Uint16 => Some(2),
            WireType::Uint8 | WireType::EnumU8 => Some(1),
            WireType::StringAscii => None,
        }
    }
}

/// Decoded register value
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Float(f64),
    Integer(i64),
    Text(String),
}

impl RegisterValue {
    /// Numeric view of this value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Float(v) => Some(*v),
            RegisterValue::Integer(v) => Some(*v as f64),
            RegisterValue::Text(_) => None,
        }
    }

    /// Integer view of this value, if it has one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RegisterValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for RegisterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for RegisterValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<i64> for RegisterValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u32> for RegisterValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<&str> for RegisterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Validation predicate applied before a value is written
pub type ValidateFn = fn(&RegisterValue) -> bool;

/// One register of the device catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDesc {
    /// 32-bit register identifier
    pub id: u32,
    /// Human-readable dotted label, e.g. `battery.soc`
    pub label: Cow<'static, str>,
    /// On-wire representation
    pub wire_type: WireType,
    /// Whether the device accepts writes to this register
    pub writable: bool,
    /// Optional validation predicate for outgoing values
    #[serde(skip)]
    pub validate: Option<ValidateFn>,
}

impl RegisterDesc {
    /// Descriptor with no validation predicate
    pub const fn new(
        id: u32,
        label: &'static str,
        wire_type: WireType,
        writable: bool,
    ) -> Self {
        Self {
            id,
            label: Cow::Borrowed(label),
            wire_type,
            writable,
            validate: None,
        }
    }
}

fn soc_in_unit_range(value: &RegisterValue) -> bool {
    matches!(value.as_f64(), Some(v) if (0.0..=1.0).contains(&v))
}

fn power_in_limits(value: &RegisterValue) -> bool {
    matches!(value.as_f64(), Some(v) if (-12_000.0..=12_000.0).contains(&v))
}

/// Built-in catalog of well-known registers
pub static BUILTIN_CATALOG: &[RegisterDesc] = &[
    RegisterDesc::new(ID_BATTERY_SOC, "battery.soc", WireType::Float32, false),
    RegisterDesc::new(
        ID_BATTERY_STATUS,
        "battery.status",
        WireType::EnumU8,
        false,
    ),
    RegisterDesc::new(0x4033_B6B8, "battery.voltage", WireType::Float32, false),
    RegisterDesc::new(0x21A2_6A88, "battery.temperature", WireType::Float32, false),
    RegisterDesc {
        id: 0x94AE_9201,
        label: Cow::Borrowed("battery.soc_target"),
        wire_type: WireType::Float32,
        writable: true,
        validate: Some(soc_in_unit_range),
    },
    RegisterDesc::new(0xB5F8_2F0E, "solar.generator_a.power_w", WireType::Float32, false),
    RegisterDesc::new(0xAA3C_04F6, "solar.generator_b.power_w", WireType::Float32, false),
    RegisterDesc::new(ID_GRID_FREQUENCY, "grid.frequency_hz", WireType::Float32, false),
    RegisterDesc {
        id: 0x8FC8_9B10,
        label: Cow::Borrowed("grid.max_feed_w"),
        wire_type: WireType::Float32,
        writable: true,
        validate: Some(power_in_limits),
    },
    RegisterDesc::new(0x1D0F_54B3, "inverter.state", WireType::EnumU8, false),
    RegisterDesc::new(0x6B58_1E9A, "inverter.relay_cycles", WireType::Uint32, false),
    RegisterDesc::new(0x72D3_B1C4, "inverter.phases", WireType::Uint8, false),
    RegisterDesc::new(0x5A29_E05F, "device.name", WireType::StringAscii, false),
    RegisterDesc {
        id: 0xC3B0_41D2,
        label: Cow::Borrowed("display.brightness"),
        wire_type: WireType::Uint8,
        writable: true,
        validate: None,
    },
];

/// Look up a built-in register by id
pub fn find_register(id: u32) -> Option<&'static RegisterDesc> {
    BUILTIN_CATALOG.iter().find(|r| r.id == id)
}

/// Look up a built-in register by label
pub fn find_register_by_label(label: &str) -> Option<&'static RegisterDesc> {
    BUILTIN_CATALOG.iter().find(|r| r.label == label)
}

/// Encode a value into payload bytes for the register's wire type.
///
/// Multi-byte encodings are big-endian. Fails fast with
/// [`LinkError::InvalidArgument`] on range violations; the caller is
/// responsible for running the descriptor's validation predicate first.
pub fn encode_value(register: &RegisterDesc, value: &RegisterValue) -> Result<Vec<u8>> {
    match register.wire_type {
        WireType::Float32 => {
            let v = value.as_f64().ok_or_else(|| {
                LinkError::invalid_argument(format!("{}: expected a number", register.label))
            })?;
            Ok((v as f32).to_be_bytes().to_vec())
        },
        WireType::Uint8 | WireType::EnumU8 => {
            let v = integer_in_range(register, value, u8::MAX as i64)?;
            Ok(vec![v as u8])
        },
        WireType::Uint16 => {
            let v = integer_in_range(register, value, u16::MAX as i64)?;
            Ok((v as u16).to_be_bytes().to_vec())
        },
        WireType::Uint32 => {
            let v = integer_in_range(register, value, u32::MAX as i64)?;
            Ok((v as u32).to_be_bytes().to_vec())
        },
        WireType::StringAscii => {
            let RegisterValue::Text(text) = value else {
                return Err(LinkError::invalid_argument(format!(
                    "{}: expected text",
                    register.label
                )));
            };
            if !text.is_ascii() {
                return Err(LinkError::invalid_argument(format!(
                    "{}: text must be ASCII",
                    register.label
                )));
            }
            if text.len() > MAX_PAYLOAD {
                return Err(LinkError::invalid_argument(format!(
                    "{}: text too long ({} bytes, max {})",
                    register.label,
                    text.len(),
                    MAX_PAYLOAD
                )));
            }
            Ok(text.as_bytes().to_vec())
        },
    }
}

fn integer_in_range(register: &RegisterDesc, value: &RegisterValue, max: i64) -> Result<i64> {
    let v = value.as_i64().ok_or_else(|| {
        LinkError::invalid_argument(format!("{}: expected an integer", register.label))
    })?;
    if !(0..=max).contains(&v) {
        return Err(LinkError::invalid_argument(format!(
            "{}: {} out of range 0..={}",
            register.label, v, max
        )));
    }
    Ok(v)
}

/// Decode response payload bytes per the register's wire type.
pub fn decode_value(register: &RegisterDesc, data: &[u8]) -> Result<RegisterValue> {
    if let Some(expected) = register.wire_type.payload_len() {
        if data.len() != expected {
            return Err(LinkError::invalid_data(format!(
                "{}: expected {} payload bytes, got {}",
                register.label,
                expected,
                data.len()
            )));
        }
    }
    match register.wire_type {
        WireType::Float32 => {
            let v = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            Ok(RegisterValue::Float(f64::from(v)))
        },
        WireType::Uint8 | WireType::EnumU8 => Ok(RegisterValue::Integer(i64::from(data[0]))),
        WireType::Uint16 => {
            let v = u16::from_be_bytes([data[0], data[1]]);
            Ok(RegisterValue::Integer(i64::from(v)))
        },
        WireType::Uint32 => {
            let v = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            Ok(RegisterValue::Integer(i64::from(v)))
        },
        WireType::StringAscii => {
            // The device NUL-pads fixed text buffers.
            let text_end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            let bytes = &data[..text_end];
            if !bytes.is_ascii() {
                return Err(LinkError::invalid_data(format!(
                    "{}: non-ASCII text payload",
                    register.label
                )));
            }
            Ok(RegisterValue::Text(
                String::from_utf8_lossy(bytes).into_owned(),
            ))
        },
    }
}
