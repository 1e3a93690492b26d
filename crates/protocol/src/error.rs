//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer speaks a different USB/IP revision
    #[error("Unsupported USB/IP version: {found:#06x} (expected {expected:#06x})")]
    UnsupportedVersion { found: u16, expected: u16 },

    /// Operation code not defined by the protocol
    #[error("Unknown operation code: {0:#06x}")]
    UnknownOpCode(u16),

    /// Operation code is valid but not the one this message expects
    #[error("Unexpected operation code: {found:#06x} (expected {expected:#06x})")]
    UnexpectedOpCode { found: u16, expected: u16 },

    /// Status value outside the protocol's status table
    #[error("Unknown operation status: {0}")]
    UnknownStatus(u32),

    /// Fixed-width string field cannot hold the value
    #[error("{field} too long: {len} bytes (max: {max})")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// String would be truncated at the embedded NUL on decode
    #[error("{field} contains a NUL byte")]
    InteriorNul { field: &'static str },

    /// Fixed-width string field is not valid UTF-8
    #[error("{field} is not valid UTF-8")]
    InvalidString { field: &'static str },

    /// Interface list disagrees with the descriptor's interface count
    #[error("Interface count mismatch: descriptor says {declared}, got {actual}")]
    InterfaceCountMismatch { declared: u8, actual: usize },

    /// Device list claims more entries than any host could export
    #[error("Device list too large: {count} entries (max: {max})")]
    DeviceListTooLarge { count: u32, max: u32 },

    /// I/O error while reading or writing a message
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the stream before a full message arrived.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
