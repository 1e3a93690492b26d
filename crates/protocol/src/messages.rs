//! USB/IP message definitions
//!
//! Every exchange starts with an [`OpCommon`] header. Requests are sent as
//! the header followed by the request body; the server decodes the header
//! first and dispatches on its code. Reply types carry their own header, so
//! encoding a reply writes the complete message.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::codec::{Decode, Encode, FixedSize, read_fixed_str, write_fixed_str};
use crate::error::{ProtocolError, Result};
use crate::types::{DeviceSpeed, OpCode, OpStatus};
use crate::version::{USBIP_VERSION, validate_version};

/// Size of the sysfs path field in a device descriptor
pub const DEVICE_PATH_SIZE: usize = 256;

/// Size of a bus id field
pub const BUS_ID_SIZE: usize = 32;

/// Upper bound on devices accepted in a single device list reply
pub const MAX_DEVICE_LIST_LEN: u32 = 4096;

/// Header shared by every request and reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCommon {
    pub version: u16,
    pub code: OpCode,
    pub status: OpStatus,
}

impl OpCommon {
    /// Header for an outgoing request
    pub fn request(code: OpCode) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status: OpStatus::Ok,
        }
    }

    /// Header for an outgoing reply
    pub fn reply(code: OpCode, status: OpStatus) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    /// Decode a header and require the given code and the current version
    pub fn decode_expecting<R: Read>(reader: &mut R, expected: OpCode) -> Result<Self> {
        let common = Self::decode(reader)?;
        validate_version(common.version)?;
        if common.code != expected {
            return Err(ProtocolError::UnexpectedOpCode {
                found: common.code.as_u16(),
                expected: expected.as_u16(),
            });
        }
        Ok(common)
    }
}

impl FixedSize for OpCommon {
    const SIZE: usize = 8;
}

impl Encode for OpCommon {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(self.code.as_u16())?;
        writer.write_u32::<BigEndian>(self.status.as_u32())?;
        Ok(())
    }
}

impl Decode for OpCommon {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let code = OpCode::from_u16(reader.read_u16::<BigEndian>()?)?;
        let status = OpStatus::from_u32(reader.read_u32::<BigEndian>()?)?;
        Ok(Self {
            version,
            code,
            status,
        })
    }
}

/// Exported device as described on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub path: String,
    pub bus_id: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_configuration_value: u8,
    pub b_num_configurations: u8,
    pub b_num_interfaces: u8,
}

impl DeviceDescriptor {
    /// Descriptor carrying only a bus id, as sent in export requests
    pub fn for_bus_id(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            ..Default::default()
        }
    }

    /// Kernel device id: bus number in the high half, device number in the low
    pub fn dev_id(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }
}

impl FixedSize for DeviceDescriptor {
    const SIZE: usize = DEVICE_PATH_SIZE + BUS_ID_SIZE + 4 * 3 + 2 * 3 + 6;
}

impl Encode for DeviceDescriptor {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_fixed_str(writer, "path", &self.path, DEVICE_PATH_SIZE)?;
        write_fixed_str(writer, "busid", &self.bus_id, BUS_ID_SIZE)?;
        writer.write_u32::<BigEndian>(self.busnum)?;
        writer.write_u32::<BigEndian>(self.devnum)?;
        writer.write_u32::<BigEndian>(self.speed.as_u32())?;
        writer.write_u16::<BigEndian>(self.id_vendor)?;
        writer.write_u16::<BigEndian>(self.id_product)?;
        writer.write_u16::<BigEndian>(self.bcd_device)?;
        writer.write_all(&[
            self.b_device_class,
            self.b_device_sub_class,
            self.b_device_protocol,
            self.b_configuration_value,
            self.b_num_configurations,
            self.b_num_interfaces,
        ])?;
        Ok(())
    }
}

impl Decode for DeviceDescriptor {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let path = read_fixed_str(reader, "path", DEVICE_PATH_SIZE)?;
        let bus_id = read_fixed_str(reader, "busid", BUS_ID_SIZE)?;
        let busnum = reader.read_u32::<BigEndian>()?;
        let devnum = reader.read_u32::<BigEndian>()?;
        let speed = DeviceSpeed::from_u32(reader.read_u32::<BigEndian>()?);
        let id_vendor = reader.read_u16::<BigEndian>()?;
        let id_product = reader.read_u16::<BigEndian>()?;
        let bcd_device = reader.read_u16::<BigEndian>()?;
        let mut tail = [0u8; 6];
        reader.read_exact(&mut tail)?;

        Ok(Self {
            path,
            bus_id,
            busnum,
            devnum,
            speed,
            id_vendor,
            id_product,
            bcd_device,
            b_device_class: tail[0],
            b_device_sub_class: tail[1],
            b_device_protocol: tail[2],
            b_configuration_value: tail[3],
            b_num_configurations: tail[4],
            b_num_interfaces: tail[5],
        })
    }
}

/// Interface class triple; the fourth wire byte is padding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
}

impl FixedSize for InterfaceDescriptor {
    const SIZE: usize = 4;
}

impl Encode for InterfaceDescriptor {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.class, self.sub_class, self.protocol, 0])?;
        Ok(())
    }
}

impl Decode for InterfaceDescriptor {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(Self {
            class: buf[0],
            sub_class: buf[1],
            protocol: buf[2],
        })
    }
}

/// One entry of a device list reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub descriptor: DeviceDescriptor,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl Encode for DeviceInfo {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        let declared = self.descriptor.b_num_interfaces;
        if usize::from(declared) != self.interfaces.len() {
            return Err(ProtocolError::InterfaceCountMismatch {
                declared,
                actual: self.interfaces.len(),
            });
        }

        self.descriptor.encode(writer)?;
        for iface in &self.interfaces {
            iface.encode(writer)?;
        }
        Ok(())
    }
}

impl Decode for DeviceInfo {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let descriptor = DeviceDescriptor::decode(reader)?;
        let interfaces = (0..descriptor.b_num_interfaces)
            .map(|_| InterfaceDescriptor::decode(reader))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            descriptor,
            interfaces,
        })
    }
}

/// `OP_REP_DEVLIST`: the devices a server offers for import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevListReply {
    pub status: OpStatus,
    pub devices: Vec<DeviceInfo>,
}

impl DevListReply {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            status: OpStatus::Ok,
            devices,
        }
    }
}

impl Encode for DevListReply {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        let count = u32::try_from(self.devices.len()).unwrap_or(u32::MAX);
        if count > MAX_DEVICE_LIST_LEN {
            return Err(ProtocolError::DeviceListTooLarge {
                count,
                max: MAX_DEVICE_LIST_LEN,
            });
        }

        OpCommon::reply(OpCode::RepDevList, self.status).encode(writer)?;
        writer.write_u32::<BigEndian>(count)?;
        for device in &self.devices {
            device.encode(writer)?;
        }
        Ok(())
    }
}

impl Decode for DevListReply {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let common = OpCommon::decode_expecting(reader, OpCode::RepDevList)?;
        let count = reader.read_u32::<BigEndian>()?;
        if count > MAX_DEVICE_LIST_LEN {
            return Err(ProtocolError::DeviceListTooLarge {
                count,
                max: MAX_DEVICE_LIST_LEN,
            });
        }

        let devices = (0..count)
            .map(|_| DeviceInfo::decode(reader))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            status: common.status,
            devices,
        })
    }
}

/// `OP_REQ_IMPORT` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub bus_id: String,
}

impl ImportRequest {
    pub fn new(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
        }
    }
}

impl FixedSize for ImportRequest {
    const SIZE: usize = BUS_ID_SIZE;
}

impl Encode for ImportRequest {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_fixed_str(writer, "busid", &self.bus_id, BUS_ID_SIZE)
    }
}

impl Decode for ImportRequest {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            bus_id: read_fixed_str(reader, "busid", BUS_ID_SIZE)?,
        })
    }
}

/// `OP_REP_IMPORT`
///
/// The descriptor is present on the wire exactly when the status is OK, and
/// the constructors keep the two in step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReply {
    status: OpStatus,
    device: Option<DeviceDescriptor>,
}

impl ImportReply {
    pub fn ok(device: DeviceDescriptor) -> Self {
        Self {
            status: OpStatus::Ok,
            device: Some(device),
        }
    }

    /// A refused import; `OpStatus::Ok` is not a refusal and is sent as
    /// `OpStatus::Error`
    pub fn failed(status: OpStatus) -> Self {
        let status = if status.is_ok() {
            OpStatus::Error
        } else {
            status
        };
        Self {
            status,
            device: None,
        }
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    pub fn device(&self) -> Option<&DeviceDescriptor> {
        self.device.as_ref()
    }

    /// The imported device, or the status the server refused with
    pub fn into_result(self) -> std::result::Result<DeviceDescriptor, OpStatus> {
        match self.device {
            Some(device) if self.status.is_ok() => Ok(device),
            _ => Err(self.status),
        }
    }
}

impl Encode for ImportReply {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        OpCommon::reply(OpCode::RepImport, self.status).encode(writer)?;
        if let Some(device) = &self.device {
            device.encode(writer)?;
        }
        Ok(())
    }
}

impl Decode for ImportReply {
    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let common = OpCommon::decode_expecting(reader, OpCode::RepImport)?;
        if common.status.is_ok() {
            Ok(Self::ok(DeviceDescriptor::decode(reader)?))
        } else {
            Ok(Self::failed(common.status))
        }
    }
}

/// `OP_REQ_EXPORT` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub device: DeviceDescriptor,
}

/// `OP_REQ_UNEXPORT` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexportRequest {
    pub device: DeviceDescriptor,
}

macro_rules! descriptor_request {
    ($ty:ident) => {
        impl $ty {
            pub fn new(bus_id: impl Into<String>) -> Self {
                Self {
                    device: DeviceDescriptor::for_bus_id(bus_id),
                }
            }

            pub fn bus_id(&self) -> &str {
                &self.device.bus_id
            }
        }

        impl FixedSize for $ty {
            const SIZE: usize = DeviceDescriptor::SIZE;
        }

        impl Encode for $ty {
            fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
                self.device.encode(writer)
            }
        }

        impl Decode for $ty {
            fn decode<R: Read>(reader: &mut R) -> Result<Self> {
                Ok(Self {
                    device: DeviceDescriptor::decode(reader)?,
                })
            }
        }
    };
}

descriptor_request!(ExportRequest);
descriptor_request!(UnexportRequest);

/// `OP_REP_EXPORT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportReply {
    pub status: OpStatus,
    pub return_code: i32,
}

/// `OP_REP_UNEXPORT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnexportReply {
    pub status: OpStatus,
    pub return_code: i32,
}

macro_rules! status_reply {
    ($ty:ident, $code:expr) => {
        impl $ty {
            pub fn new(status: OpStatus) -> Self {
                Self {
                    status,
                    return_code: 0,
                }
            }
        }

        impl FixedSize for $ty {
            const SIZE: usize = OpCommon::SIZE + 4;
        }

        impl Encode for $ty {
            fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
                OpCommon::reply($code, self.status).encode(writer)?;
                writer.write_i32::<BigEndian>(self.return_code)?;
                Ok(())
            }
        }

        impl Decode for $ty {
            fn decode<R: Read>(reader: &mut R) -> Result<Self> {
                let common = OpCommon::decode_expecting(reader, $code)?;
                let return_code = reader.read_i32::<BigEndian>()?;
                Ok(Self {
                    status: common.status,
                    return_code,
                })
            }
        }
    };
}

status_reply!(ExportReply, OpCode::RepExport);
status_reply!(UnexportReply, OpCode::RepUnexport);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_vec};

    fn flash_drive() -> DeviceDescriptor {
        DeviceDescriptor {
            path: "/sys/devices/pci0000:00/0000:00:14.0/usb3/3-2".to_string(),
            bus_id: "3-2".to_string(),
            busnum: 3,
            devnum: 7,
            speed: DeviceSpeed::High,
            id_vendor: 0x0951,
            id_product: 0x1666,
            bcd_device: 0x0110,
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_configuration_value: 1,
            b_num_configurations: 1,
            b_num_interfaces: 1,
        }
    }

    #[test]
    fn test_op_common_layout() {
        let bytes = encode_to_vec(&OpCommon::request(OpCode::ReqImport)).unwrap();
        assert_eq!(bytes, [0x01, 0x11, 0x80, 0x03, 0, 0, 0, 0]);
    }

    #[test]
    fn test_descriptor_size() {
        assert_eq!(DeviceDescriptor::SIZE, 312);
        let bytes = encode_to_vec(&flash_drive()).unwrap();
        assert_eq!(bytes.len(), DeviceDescriptor::SIZE);
        // busnum follows path[256] + busid[32]
        assert_eq!(&bytes[288..292], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_dev_id() {
        assert_eq!(flash_drive().dev_id(), (3 << 16) | 7);
    }

    #[test]
    fn test_import_reply_error_has_no_descriptor() {
        let bytes = encode_to_vec(&ImportReply::failed(OpStatus::NoDev)).unwrap();
        assert_eq!(bytes.len(), OpCommon::SIZE);

        let decoded: ImportReply = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded.status(), OpStatus::NoDev);
        assert!(decoded.device().is_none());
    }

    #[test]
    fn test_import_reply_failed_never_claims_ok() {
        let reply = ImportReply::failed(OpStatus::Ok);
        assert_eq!(reply.status(), OpStatus::Error);

        let decoded: ImportReply = decode_from_slice(&encode_to_vec(&reply).unwrap()).unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.into_result(), Err(OpStatus::Error));
    }

    #[test]
    fn test_import_reply_ok_roundtrip() {
        let reply = ImportReply::ok(flash_drive());
        let bytes = encode_to_vec(&reply).unwrap();
        assert_eq!(bytes.len(), OpCommon::SIZE + DeviceDescriptor::SIZE);
        assert_eq!(decode_from_slice::<ImportReply>(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_interface_count_mismatch() {
        let info = DeviceInfo {
            descriptor: flash_drive(),
            interfaces: vec![],
        };
        let err = encode_to_vec(&info).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InterfaceCountMismatch {
                declared: 1,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_reply_with_wrong_code_rejected() {
        let bytes = encode_to_vec(&ExportReply::new(OpStatus::Ok)).unwrap();
        let err = decode_from_slice::<UnexportReply>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedOpCode {
                found: 0x0006,
                expected: 0x0007
            }
        ));
    }

    #[test]
    fn test_reply_with_wrong_version_rejected() {
        let mut bytes = encode_to_vec(&ImportReply::failed(OpStatus::NoDev)).unwrap();
        bytes[1] = 0x06;
        let err = decode_from_slice::<ImportReply>(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion { found: 0x0106, .. }));
    }

    #[test]
    fn test_devlist_count_limit() {
        let mut bytes = encode_to_vec(&OpCommon::reply(OpCode::RepDevList, OpStatus::Ok)).unwrap();
        bytes.extend_from_slice(&(MAX_DEVICE_LIST_LEN + 1).to_be_bytes());
        let err = decode_from_slice::<DevListReply>(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceListTooLarge { .. }));
    }
}
