//! USB subsystem
//!
//! Device model, sysfs discovery, and hot-plug tracking:
//! - [`device`]: one device directory parsed into a [`UsbDevice`]
//! - [`discovery`]: full scans of `bus/usb/devices`
//! - [`store`]: the shared device map and its change channel
//! - [`uevent`]: kernel uevent sources
//! - [`monitor`]: debounced event processing and periodic resync

pub mod device;
pub mod discovery;
pub mod monitor;
pub mod store;
pub mod uevent;

pub use device::{UsbDevice, UsbInterface, load_usb_device};
pub use discovery::{discover_plugged_usb_devices, is_usb_path};
pub use monitor::{Monitor, MonitorOptions, UdevMonitor};
pub use store::DeviceStore;
pub use uevent::{Action, ChannelUeventSource, NetlinkUeventSource, UEvent, UeventSource};
