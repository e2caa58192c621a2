//! Link Error Types
//!
//! Core error types for the inverter link protocol client.

use thiserror::Error;

/// Result type for heliolink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Inverter link errors
#[derive(Debug, Error, Clone)]
pub enum LinkError {
    /// Structural frame errors (short frame, truncated frame)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Frame checksum mismatch
    #[error("CRC mismatch: computed {computed:#06X}, received {received:#06X}")]
    Crc { computed: u16, received: u16 },

    /// Response does not match the outstanding request
    #[error("Response mismatch: {0}")]
    ResponseMismatch(String),

    /// Receive timeout while a request is outstanding
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection errors (dial failure, dial timeout)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Transport IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid argument (payload too long, value out of range, rejected by validation)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Register is not writable
    #[error("Register not writable: {0}")]
    NotWritable(String),

    /// Payload cannot be decoded for the register's wire type
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device rejected the operation because it is not in normal operation
    #[error("Device not ready: status {status:#04X}")]
    DeviceNotReady { status: u8 },

    /// Retry budget exhausted; wraps the last recoverable cause
    #[error("Retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<LinkError>,
    },

    /// Internal errors (invariant violations)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Config(format!("JSON error: {}", err))
    }
}

// Helper methods for creating errors
impl LinkError {
    pub fn frame(msg: impl Into<String>) -> Self {
        LinkError::Frame(msg.into())
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        LinkError::ResponseMismatch(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        LinkError::Timeout(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        LinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        LinkError::Io(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        LinkError::InvalidArgument(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        LinkError::InvalidData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LinkError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LinkError::Internal(msg.into())
    }

    /// Check if this error may be retried under the per-job backoff policy.
    ///
    /// Frame corruption, CRC failures, mismatched responses, receive
    /// timeouts and transient transport IO are retryable; everything else
    /// surfaces to the caller unchanged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Frame(_)
                | LinkError::Crc { .. }
                | LinkError::ResponseMismatch(_)
                | LinkError::Timeout(_)
                | LinkError::Io(_)
        )
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::Frame(_) => "E_FRAME",
            LinkError::Crc { .. } => "E_CRC",
            LinkError::ResponseMismatch(_) => "E_RESPONSE_MISMATCH",
            LinkError::Timeout(_) => "E_TIMEOUT",
            LinkError::Connection(_) => "E_CONNECTION",
            LinkError::NotConnected => "E_NOT_CONNECTED",
            LinkError::Io(_) => "E_IO",
            LinkError::InvalidArgument(_) => "E_INVALID_ARGUMENT",
            LinkError::NotWritable(_) => "E_NOT_WRITABLE",
            LinkError::InvalidData(_) => "E_INVALID_DATA",
            LinkError::Config(_) => "E_CONFIG",
            LinkError::DeviceNotReady { .. } => "E_DEVICE_NOT_READY",
            LinkError::RetriesExhausted { .. } => "E_RETRIES_EXHAUSTED",
            LinkError::Internal(_) => "E_INTERNAL",
        }
    }
}
