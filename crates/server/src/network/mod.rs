//! Network subsystem
//!
//! The USB/IP TCP daemon:
//!
//! ```text
//! UsbIpDaemon
//!   ├─> accept connections (capped)
//!   └─> spawn Connection per peer
//!         ├─> DevList: devices bound to usbip-host
//!         ├─> Import: hand socket to the kernel, then hold it until shutdown
//!         └─> Export/Unexport: delegate to the binder
//! ```

pub mod connection;
pub mod server;

pub use connection::{Connection, ConnectionError, DaemonContext};
pub use server::{DaemonOptions, UsbIpDaemon};
