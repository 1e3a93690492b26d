//! Enumeration of plugged USB devices

use common::sysfs::SysfsLayout;
use common::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::device::{UsbDevice, load_usb_device};

/// Files every USB device directory carries; interfaces and root hubs lack
/// at least one of them
const REQUIRED_FILES: [&str; 7] = [
    "uevent",
    "idVendor",
    "idProduct",
    "bDeviceClass",
    "bConfigurationValue",
    "bNumInterfaces",
    "speed",
];

/// True when `path` looks like a USB device directory
///
/// Root hubs (`usbN`) and interface directories (`<busid>:<cfg>.<n>`) are
/// rejected by name before the descriptor files are checked.
pub fn is_usb_path(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with("usb") || name.contains(':') {
        return false;
    }
    REQUIRED_FILES.iter().all(|file| path.join(file).exists())
}

/// Load every USB device under `bus/usb/devices`, keyed by sysfs path
///
/// Devices that fail to load or validate are skipped with a warning, as are
/// directory entries that cannot be read.
pub fn discover_plugged_usb_devices(layout: &SysfsLayout) -> Result<HashMap<PathBuf, UsbDevice>> {
    let root = layout.usb_devices_dir();
    let entries = fs::read_dir(&root).map_err(|e| Error::sysfs(&root, e))?;
    Ok(load_entries(layout, entries.map(|entry| entry.map(|e| e.path()))))
}

fn load_entries(
    layout: &SysfsLayout,
    entries: impl IntoIterator<Item = io::Result<PathBuf>>,
) -> HashMap<PathBuf, UsbDevice> {
    let mut devices = HashMap::new();
    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "skipping unreadable sysfs entry");
                continue;
            }
        };
        if !is_usb_path(&path) {
            continue;
        }

        let device = match load_usb_device(layout, &path).and_then(|d| d.validate().map(|_| d)) {
            Ok(device) => device,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping USB device");
                continue;
            }
        };
        debug!(bus_id = %device.bus_id, "discovered USB device");
        devices.insert(path, device);
    }
    devices
}
