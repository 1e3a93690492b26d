//! usbip-passthrough import side
//!
//! Imports devices offered by a remote `usbipd` into the local kernel's
//! virtual host controller (`vhci_hcd`), and asks peer daemons to start or
//! stop offering their devices.

pub mod attacher;
pub mod config;
pub mod exporter;
mod net;
pub mod vhci;

pub use attacher::{AttachError, AttachInfo, DetachError, SysfsAttacher, UsbAttacher};
pub use config::ClientConfig;
pub use exporter::{ExportError, TcpExporter, UsbExporter, list_remote_devices};
pub use vhci::{HubSpeed, ImportedDevice, VhciTable};
