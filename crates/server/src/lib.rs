//! usbip-passthrough export side
//!
//! Tracks physical USB devices through sysfs and kernel uevents, binds them
//! to `usbip-host`, and serves them to importing peers over USB/IP.
//!
//! The pieces an embedding application uses:
//! - [`usb::Monitor`] / [`usb::UdevMonitor`]: the current device set and its
//!   change notifications
//! - [`binder::UsbBinder`] / [`binder::SysfsBinder`]: export control
//! - [`network::UsbIpDaemon`]: the USB/IP TCP server

pub mod binder;
pub mod config;
pub mod network;
pub mod service;
pub mod usb;

pub use binder::{BindError, BindInfo, SysfsBinder, UsbBinder};
pub use config::ServerConfig;
pub use network::{DaemonOptions, UsbIpDaemon};
pub use usb::{DeviceStore, Monitor, MonitorOptions, UdevMonitor, UsbDevice};
