//! USB/IP wire protocol
//!
//! This crate implements the subset of the USB/IP protocol used between the
//! export daemon (`usbipd`) and an importing client: device listing, device
//! import, and the export/unexport negotiation between peer daemons. All
//! fields are fixed-width and big-endian.
//!
//! # Example
//!
//! ```
//! use protocol::{Decode, Encode, ImportRequest, OpCode, OpCommon};
//!
//! // A client sends the header followed by the request body
//! let mut wire = Vec::new();
//! OpCommon::request(OpCode::ReqImport).encode(&mut wire).unwrap();
//! ImportRequest::new("1-1").encode(&mut wire).unwrap();
//!
//! // The server decodes the header first, then dispatches on the code
//! let mut reader = wire.as_slice();
//! let header = OpCommon::decode(&mut reader).unwrap();
//! assert_eq!(header.code, OpCode::ReqImport);
//! let request = ImportRequest::decode(&mut reader).unwrap();
//! assert_eq!(request.bus_id, "1-1");
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod version;

pub use codec::{
    Decode, Encode, FixedSize, decode_from_slice, encode_to_vec, read_fixed_str, write_fixed_str,
};

#[cfg(feature = "async")]
pub use codec::{read_message_async, write_message_async};

pub use error::{ProtocolError, Result};
pub use messages::{
    BUS_ID_SIZE, DEVICE_PATH_SIZE, DevListReply, DeviceDescriptor, DeviceInfo, ExportReply,
    ExportRequest, ImportReply, ImportRequest, InterfaceDescriptor, MAX_DEVICE_LIST_LEN, OpCommon,
    UnexportReply, UnexportRequest,
};
pub use types::{DeviceSpeed, DeviceStatus, OpCode, OpStatus, PortStatus};
pub use version::{USBIP_VERSION, validate_version};
