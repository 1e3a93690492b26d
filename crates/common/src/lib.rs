//! Common utilities for usbip-passthrough
//!
//! This crate provides functionality shared between the export daemon and
//! the importing client: error handling, logging setup, the sysfs layout and
//! attribute helpers, and the socket handoff type used when a descriptor is
//! given to the kernel.

pub mod error;
pub mod handoff;
pub mod logging;
pub mod sysfs;
pub mod test_utils;

pub use error::{Error, Result};
pub use handoff::DetachedFd;
pub use logging::setup_logging;
pub use sysfs::{DriverAttr, SysfsLayout, USBIP_HOST_DRIVER};
