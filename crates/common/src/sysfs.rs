//! Sysfs layout and attribute access
//!
//! All paths are derived from an injected [`SysfsLayout`] so tests can point
//! the whole stack at a fixture tree instead of `/sys`.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::trace;

use crate::error::{Error, Result};
use protocol::DeviceStatus;

/// Kernel driver that exports devices over USB/IP
pub const USBIP_HOST_DRIVER: &str = "usbip-host";

/// Default sysfs mount point
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Name prefix of VHCI platform devices
pub const VHCI_HCD_PREFIX: &str = "vhci_hcd";

/// Control attributes of a USB driver directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverAttr {
    Bind,
    Unbind,
    Rebind,
    MatchBusId,
}

impl DriverAttr {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Rebind => "rebind",
            Self::MatchBusId => "match_busid",
        }
    }
}

/// Location of the sysfs tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysfsLayout {
    root: PathBuf,
}

impl Default for SysfsLayout {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/sys/bus/usb/devices`
    pub fn usb_devices_dir(&self) -> PathBuf {
        self.root.join("bus/usb/devices")
    }

    pub fn usb_device(&self, bus_id: &str) -> PathBuf {
        self.usb_devices_dir().join(bus_id)
    }

    pub fn usb_driver(&self, driver: &str) -> PathBuf {
        self.root.join("bus/usb/drivers").join(driver)
    }

    pub fn driver_attr(&self, driver: &str, attr: DriverAttr) -> PathBuf {
        self.usb_driver(driver).join(attr.as_str())
    }

    pub fn usbip_status(&self, bus_id: &str) -> PathBuf {
        self.usb_device(bus_id).join("usbip_status")
    }

    pub fn usbip_sockfd(&self, bus_id: &str) -> PathBuf {
        self.usb_device(bus_id).join("usbip_sockfd")
    }

    /// `/sys/devices/platform`
    pub fn platform_dir(&self) -> PathBuf {
        self.root.join("devices/platform")
    }

    pub fn vhci_hcd(&self, index: u32) -> PathBuf {
        self.platform_dir()
            .join(format!("{}.{}", VHCI_HCD_PREFIX, index))
    }
}

/// Read an attribute and trim surrounding whitespace
pub fn read_attr(path: &Path) -> Result<String> {
    let data = fs::read_to_string(path).map_err(|e| Error::sysfs(path, e))?;
    Ok(data.trim().to_string())
}

/// Read and parse a numeric (or otherwise `FromStr`) attribute
pub fn read_attr_parsed<T>(path: &Path) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = read_attr(path)?;
    value
        .parse()
        .map_err(|e| Error::parse(path, format!("{value:?}: {e}")))
}

/// Write a value to a sysfs attribute
///
/// The attribute must already exist; sysfs files are never created from
/// user space.
pub fn write_attr(path: &Path, value: impl Display) -> Result<()> {
    let value = value.to_string();
    trace!(path = %path.display(), value = %value, "writing sysfs attribute");

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::sysfs(path, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| Error::sysfs(path, e))?;
    Ok(())
}

/// Kernel export state of a device bound to `usbip-host`
pub fn read_usbip_status(layout: &SysfsLayout, bus_id: &str) -> Result<DeviceStatus> {
    let raw: u32 = read_attr_parsed(&layout.usbip_status(bus_id))?;
    Ok(DeviceStatus::from_u32(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = SysfsLayout::new("/tmp/fake");
        assert_eq!(
            layout.usb_device("3-2.1"),
            PathBuf::from("/tmp/fake/bus/usb/devices/3-2.1")
        );
        assert_eq!(
            layout.driver_attr(USBIP_HOST_DRIVER, DriverAttr::MatchBusId),
            PathBuf::from("/tmp/fake/bus/usb/drivers/usbip-host/match_busid")
        );
        assert_eq!(
            layout.vhci_hcd(1),
            PathBuf::from("/tmp/fake/devices/platform/vhci_hcd.1")
        );
        assert_eq!(SysfsLayout::default().root(), Path::new("/sys"));
    }

    #[test]
    fn test_read_attr_trims() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("idVendor");
        fs::write(&path, "0951\n").unwrap();
        assert_eq!(read_attr(&path).unwrap(), "0951");
    }

    #[test]
    fn test_read_attr_parsed_error_has_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busnum");
        fs::write(&path, "abc").unwrap();
        let err = read_attr_parsed::<u32>(&path).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert!(err.to_string().contains("busnum"));
    }

    #[test]
    fn test_write_attr_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bind");
        let err = write_attr(&path, "1-1").unwrap_err();
        assert!(err.is_not_found());

        fs::write(&path, "").unwrap();
        write_attr(&path, "1-1").unwrap();
        write_attr(&path, "2").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "2");
    }

    #[test]
    fn test_read_usbip_status() {
        let dir = TempDir::new().unwrap();
        let layout = SysfsLayout::new(dir.path());
        let device = layout.usb_device("1-1");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("usbip_status"), "2\n").unwrap();
        assert_eq!(
            read_usbip_status(&layout, "1-1").unwrap(),
            DeviceStatus::Used
        );
    }
}
