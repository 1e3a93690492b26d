//! USB/IP protocol type definitions
//!
//! Operation codes, status tables and the small enums shared by the wire
//! format and the sysfs surface (device speed, per-device export status,
//! VHCI port status).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Operation code carried in every `OpCommon` header
///
/// Requests have the high bit set; the matching reply clears it.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    ReqDevInfo = 0x8002,
    RepDevInfo = 0x0002,
    ReqImport = 0x8003,
    RepImport = 0x0003,
    ReqCrypkey = 0x8004,
    RepCrypkey = 0x0004,
    ReqDevList = 0x8005,
    RepDevList = 0x0005,
    ReqExport = 0x8006,
    RepExport = 0x0006,
    ReqUnexport = 0x8007,
    RepUnexport = 0x0007,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0x8002 => Ok(Self::ReqDevInfo),
            0x0002 => Ok(Self::RepDevInfo),
            0x8003 => Ok(Self::ReqImport),
            0x0003 => Ok(Self::RepImport),
            0x8004 => Ok(Self::ReqCrypkey),
            0x0004 => Ok(Self::RepCrypkey),
            0x8005 => Ok(Self::ReqDevList),
            0x0005 => Ok(Self::RepDevList),
            0x8006 => Ok(Self::ReqExport),
            0x0006 => Ok(Self::RepExport),
            0x8007 => Ok(Self::ReqUnexport),
            0x0007 => Ok(Self::RepUnexport),
            _ => Err(ProtocolError::UnknownOpCode(value)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// True for the request half of a request/reply pair
    pub fn is_request(self) -> bool {
        self.as_u16() & 0x8000 != 0
    }
}

/// Status returned to a remote peer in `OpCommon`
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpStatus {
    /// Request completed
    Ok = 0,
    /// Request not available (e.g. export handoff could not be performed)
    Na = 1,
    /// Device is already in use by another importer
    DevBusy = 2,
    /// Device is in an error state
    DevErr = 3,
    /// No such device
    NoDev = 4,
    /// Unexpected server-side failure
    Error = 5,
}

impl OpStatus {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Na),
            2 => Ok(Self::DevBusy),
            3 => Ok(Self::DevErr),
            4 => Ok(Self::NoDev),
            5 => Ok(Self::Error),
            _ => Err(ProtocolError::UnknownStatus(value)),
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "request completed successfully",
            Self::Na => "request not available",
            Self::DevBusy => "device busy (exported)",
            Self::DevErr => "device in error state",
            Self::NoDev => "device not found",
            Self::Error => "unexpected response",
        };
        f.write_str(s)
    }
}

/// USB device speed
///
/// Discriminants follow the kernel's `enum usb_device_speed`, which is what
/// travels on the wire and what the VHCI `attach` attribute expects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpeed {
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps and up (USB 3.1+)
    SuperPlus,
}

impl DeviceSpeed {
    /// Kernel `usb_device_speed` value
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }

    /// Values the kernel may report but we never export (wireless = 4)
    /// collapse to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    /// Parse the Mbps text of a sysfs `speed` attribute
    pub fn from_sysfs(text: &str) -> Self {
        match text.trim() {
            "1.5" => Self::Low,
            "12" => Self::Full,
            "480" => Self::High,
            "5000" => Self::Super,
            "10000" | "20000" => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    /// SuperSpeed devices can only sit on a SuperSpeed root hub port
    pub fn is_super_family(self) -> bool {
        matches!(self, Self::Super | Self::SuperPlus)
    }
}

/// Export state of a device bound to `usbip-host`, read from its
/// `usbip_status` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Available,
    Used,
    Error,
    Unknown(u32),
}

impl DeviceStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Used,
            3 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Status reported to an importer for this export state
    pub fn to_op_status(self) -> OpStatus {
        match self {
            Self::Available => OpStatus::Ok,
            Self::Used => OpStatus::DevBusy,
            Self::Error => OpStatus::DevErr,
            Self::Unknown(_) => OpStatus::Na,
        }
    }
}

/// State of one VHCI root hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    Null,
    NotAssigned,
    Used,
    Error,
    Unknown(u32),
}

impl PortStatus {
    pub fn from_u32(value: u32) -> Self {
        match value {
            4 => Self::Null,
            5 => Self::NotAssigned,
            6 => Self::Used,
            7 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Null => 4,
            Self::NotAssigned => 5,
            Self::Used => 6,
            Self::Error => 7,
            Self::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_request_bit() {
        assert!(OpCode::ReqImport.is_request());
        assert!(!OpCode::RepImport.is_request());
        assert_eq!(OpCode::from_u16(0x8005).unwrap(), OpCode::ReqDevList);
        assert!(matches!(
            OpCode::from_u16(0x9999),
            Err(ProtocolError::UnknownOpCode(0x9999))
        ));
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(DeviceSpeed::Low.as_u32(), 1);
        assert_eq!(DeviceSpeed::Full.as_u32(), 2);
        assert_eq!(DeviceSpeed::High.as_u32(), 3);
        assert_eq!(DeviceSpeed::Super.as_u32(), 5); // USB_SPEED_SUPER
        assert_eq!(DeviceSpeed::SuperPlus.as_u32(), 6); // USB_SPEED_SUPER_PLUS
        assert_eq!(DeviceSpeed::from_u32(4), DeviceSpeed::Unknown); // wireless
    }

    #[test]
    fn test_speed_from_sysfs() {
        assert_eq!(DeviceSpeed::from_sysfs("1.5\n"), DeviceSpeed::Low);
        assert_eq!(DeviceSpeed::from_sysfs("12"), DeviceSpeed::Full);
        assert_eq!(DeviceSpeed::from_sysfs("480"), DeviceSpeed::High);
        assert_eq!(DeviceSpeed::from_sysfs("5000"), DeviceSpeed::Super);
        assert_eq!(DeviceSpeed::from_sysfs("20000"), DeviceSpeed::SuperPlus);
        assert_eq!(DeviceSpeed::from_sysfs("garbage"), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_device_status_to_op_status() {
        assert_eq!(DeviceStatus::from_u32(1).to_op_status(), OpStatus::Ok);
        assert_eq!(DeviceStatus::from_u32(2).to_op_status(), OpStatus::DevBusy);
        assert_eq!(DeviceStatus::from_u32(3).to_op_status(), OpStatus::DevErr);
        assert_eq!(DeviceStatus::from_u32(9).to_op_status(), OpStatus::Na);
    }

    #[test]
    fn test_port_status_roundtrip() {
        for raw in [4, 5, 6, 7, 42] {
            assert_eq!(PortStatus::from_u32(raw).as_u32(), raw);
        }
    }
}
