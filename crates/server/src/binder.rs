//! `usbip-host` driver binding
//!
//! Binding a device to `usbip-host` makes it exportable. The sequence is a
//! series of independent sysfs writes:
//!
//! 1. unbind the current driver, if any
//! 2. `match_busid` `add <busid>` so kernel probing picks `usbip-host`
//! 3. `bind`
//!
//! If step 3 fails the match entry is removed and the original driver is
//! asked to rebind, so the device is not left driverless.

use common::sysfs::{DriverAttr, SysfsLayout, VHCI_HCD_PREFIX, read_attr, write_attr};
use common::USBIP_HOST_DRIVER;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::usb::device::HUB_CLASS;
use crate::usb::discovery::{discover_plugged_usb_devices, is_usb_path};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("USB device {0} not found")]
    DeviceNotFound(String),

    #[error("USB device {0} is a hub and cannot be exported")]
    IsHub(String),

    #[error("USB device {0} is already bound to usbip-host")]
    AlreadyBound(String),

    #[error("USB device {0} is not bound to usbip-host")]
    NotBound(String),

    #[error("USB device {0} is attached through VHCI and cannot be re-exported")]
    BindLoop(String),

    #[error("failed to unbind {bus_id} from driver {driver}: {source}")]
    UnbindOther {
        bus_id: String,
        driver: String,
        #[source]
        source: common::Error,
    },

    #[error(transparent)]
    Sysfs(#[from] common::Error),
}

pub type Result<T> = std::result::Result<T, BindError>;

/// Snapshot of one device's export state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindInfo {
    pub device_path: PathBuf,
    pub bus_id: String,
    pub busnum: u32,
    pub devnum: u32,
    pub bound: bool,
}

#[derive(Debug)]
struct BindState {
    driver: String,
    is_hub: bool,
}

/// Server-side export control
pub trait UsbBinder: Send + Sync {
    fn bind(&self, bus_id: &str) -> Result<()>;
    fn unbind(&self, bus_id: &str) -> Result<()>;
    fn is_bound(&self, bus_id: &str) -> Result<bool>;
    fn get_bind_info(&self) -> Result<Vec<BindInfo>>;
}

/// [`UsbBinder`] backed by the `usbip-host` sysfs control files
#[derive(Debug)]
pub struct SysfsBinder {
    layout: SysfsLayout,
    lock: Mutex<()>,
}

impl SysfsBinder {
    pub fn new(layout: SysfsLayout) -> Self {
        Self {
            layout,
            lock: Mutex::new(()),
        }
    }

    /// Read only what binding decisions need, so an unrelated malformed
    /// attribute does not block export
    fn load(&self, bus_id: &str) -> Result<BindState> {
        let path = self.layout.usb_device(bus_id);
        if !is_usb_path(&path) {
            return Err(BindError::DeviceNotFound(bus_id.to_string()));
        }

        let class_path = path.join("bDeviceClass");
        let raw = read_attr(&class_path)?;
        let class = u8::from_str_radix(&raw, 16)
            .map_err(|e| common::Error::parse(&class_path, format!("{raw:?}: {e}")))?;

        let uevent = path.join("uevent");
        let content = fs::read_to_string(&uevent).map_err(|e| common::Error::sysfs(&uevent, e))?;
        let driver = content
            .lines()
            .find_map(|line| line.strip_prefix("DRIVER="))
            .unwrap_or_default()
            .to_string();

        Ok(BindState {
            driver,
            is_hub: class == HUB_CLASS,
        })
    }

    /// Imported devices live under a `vhci_hcd.N` platform device
    fn is_vhci_device(&self, bus_id: &str) -> Result<bool> {
        let path = self.layout.usb_device(bus_id);
        let resolved = fs::canonicalize(&path).map_err(|e| common::Error::sysfs(&path, e))?;
        Ok(resolved.components().any(|c| {
            c.as_os_str()
                .to_string_lossy()
                .starts_with(VHCI_HCD_PREFIX)
        }))
    }

    fn host_attr(&self, attr: DriverAttr) -> PathBuf {
        self.layout.driver_attr(USBIP_HOST_DRIVER, attr)
    }

    fn rollback(&self, bus_id: &str, original_driver: Option<&str>) {
        if let Err(e) = write_attr(&self.host_attr(DriverAttr::MatchBusId), format!("del {bus_id}"))
        {
            warn!(bus_id, error = %e, "failed to remove match_busid entry");
        }
        if let Some(driver) = original_driver {
            let rebind = self.layout.driver_attr(driver, DriverAttr::Bind);
            if let Err(e) = write_attr(&rebind, bus_id) {
                warn!(bus_id, driver, error = %e, "failed to restore original driver");
            }
        }
    }
}

impl UsbBinder for SysfsBinder {
    fn bind(&self, bus_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let device = self.load(bus_id)?;
        if self.is_vhci_device(bus_id)? {
            return Err(BindError::BindLoop(bus_id.to_string()));
        }
        if device.is_hub {
            return Err(BindError::IsHub(bus_id.to_string()));
        }
        if device.driver == USBIP_HOST_DRIVER {
            return Err(BindError::AlreadyBound(bus_id.to_string()));
        }

        let original_driver = (!device.driver.is_empty()).then_some(device.driver.as_str());
        if let Some(driver) = original_driver {
            write_attr(&self.layout.driver_attr(driver, DriverAttr::Unbind), bus_id).map_err(
                |source| BindError::UnbindOther {
                    bus_id: bus_id.to_string(),
                    driver: driver.to_string(),
                    source,
                },
            )?;
        }

        if let Err(e) = write_attr(&self.host_attr(DriverAttr::MatchBusId), format!("add {bus_id}"))
        {
            self.rollback(bus_id, original_driver);
            return Err(e.into());
        }
        if let Err(e) = write_attr(&self.host_attr(DriverAttr::Bind), bus_id) {
            self.rollback(bus_id, original_driver);
            return Err(e.into());
        }

        info!(bus_id, previous_driver = ?original_driver, "bound to usbip-host");
        Ok(())
    }

    fn unbind(&self, bus_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let device = self.load(bus_id)?;
        if device.driver != USBIP_HOST_DRIVER {
            return Err(BindError::NotBound(bus_id.to_string()));
        }

        write_attr(&self.host_attr(DriverAttr::Unbind), bus_id)?;
        write_attr(&self.host_attr(DriverAttr::MatchBusId), format!("del {bus_id}"))?;
        write_attr(&self.host_attr(DriverAttr::Rebind), bus_id)?;

        info!(bus_id, "unbound from usbip-host");
        Ok(())
    }

    fn is_bound(&self, bus_id: &str) -> Result<bool> {
        Ok(self.load(bus_id)?.driver == USBIP_HOST_DRIVER)
    }

    fn get_bind_info(&self) -> Result<Vec<BindInfo>> {
        let mut info: Vec<BindInfo> = discover_plugged_usb_devices(&self.layout)?
            .into_values()
            .map(|device| BindInfo {
                bound: device.driver == USBIP_HOST_DRIVER,
                device_path: device.device_path,
                bus_id: device.bus_id,
                busnum: device.bus,
                devnum: device.device_number,
            })
            .collect();
        info.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        Ok(info)
    }
}
