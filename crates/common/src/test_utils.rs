//! Test utilities for usbip-passthrough
//!
//! Builders for fake sysfs trees and async test helpers shared by the
//! server and client test suites.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{FixtureDevice, SysfsFixture};
//!
//! let dir = std::env::temp_dir().join(format!("sysfs-doc-{}", std::process::id()));
//! let fixture = SysfsFixture::new(&dir).unwrap();
//! let path = fixture.add_device(&FixtureDevice::new("1-1", 0x0951, 0x1666)).unwrap();
//! assert!(path.join("idVendor").exists());
//! # std::fs::remove_dir_all(&dir).unwrap();
//! ```

use std::fs;
use std::future::Future;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sysfs::{DriverAttr, SysfsLayout, USBIP_HOST_DRIVER};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A USB device to materialize in a [`SysfsFixture`]
#[derive(Debug, Clone)]
pub struct FixtureDevice {
    pub bus_id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd: u16,
    pub busnum: u32,
    pub devnum: u32,
    pub major: u32,
    pub minor: u32,
    pub class: (u8, u8, u8),
    pub driver: Option<String>,
    pub speed: String,
    pub configuration_value: String,
    pub num_configurations: String,
    pub interfaces: Vec<(u8, u8, u8)>,
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub usbip_status: Option<u32>,
    pub under_vhci: bool,
    /// Descriptor files left out of the device directory
    pub omit: Vec<&'static str>,
}

impl FixtureDevice {
    /// A configured full-speed device with one mass storage interface
    pub fn new(bus_id: &str, vendor_id: u16, product_id: u16) -> Self {
        let busnum = bus_id
            .split('-')
            .next()
            .and_then(|b| b.parse().ok())
            .unwrap_or(1);
        Self {
            bus_id: bus_id.to_string(),
            vendor_id,
            product_id,
            bcd: 0x0100,
            busnum,
            devnum: 2,
            major: 189,
            minor: 1,
            class: (0, 0, 0),
            driver: Some("usb".to_string()),
            speed: "12".to_string(),
            configuration_value: "1".to_string(),
            num_configurations: "1".to_string(),
            interfaces: vec![(8, 6, 80)],
            serial: Some(format!("SN-{bus_id}")),
            manufacturer: Some("Test Manufacturer".to_string()),
            product: Some("Test Product".to_string()),
            usbip_status: None,
            under_vhci: false,
            omit: Vec::new(),
        }
    }

    pub fn with_devnum(mut self, devnum: u32) -> Self {
        self.devnum = devnum;
        self
    }

    pub fn with_driver(mut self, driver: Option<&str>) -> Self {
        self.driver = driver.map(str::to_string);
        self
    }

    /// Bound to `usbip-host` with the given `usbip_status`
    pub fn exported(mut self, status: u32) -> Self {
        self.driver = Some(USBIP_HOST_DRIVER.to_string());
        self.usbip_status = Some(status);
        self
    }

    pub fn hub(mut self) -> Self {
        self.class = (9, 0, 1);
        self.driver = Some("hub".to_string());
        self.interfaces = vec![(9, 0, 0)];
        self
    }

    pub fn with_speed(mut self, speed: &str) -> Self {
        self.speed = speed.to_string();
        self
    }

    pub fn with_interfaces(mut self, interfaces: Vec<(u8, u8, u8)>) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub fn without(mut self, file: &'static str) -> Self {
        self.omit.push(file);
        self
    }

    /// Place the device below a VHCI controller, as imported devices are
    pub fn imported_through_vhci(mut self) -> Self {
        self.under_vhci = true;
        self
    }

    fn uevent(&self) -> String {
        let mut lines = vec![
            format!("MAJOR={}", self.major),
            format!("MINOR={}", self.minor),
            format!("DEVNAME=bus/usb/{:03}/{:03}", self.busnum, self.devnum),
            "DEVTYPE=usb_device".to_string(),
        ];
        if let Some(driver) = &self.driver {
            lines.push(format!("DRIVER={driver}"));
        }
        lines.push(format!(
            "PRODUCT={:x}/{:x}/{:x}",
            self.vendor_id, self.product_id, self.bcd
        ));
        lines.push(format!(
            "TYPE={}/{}/{}",
            self.class.0, self.class.1, self.class.2
        ));
        lines.push(format!("BUSNUM={:03}", self.busnum));
        lines.push(format!("DEVNUM={:03}", self.devnum));
        lines.join("\n") + "\n"
    }
}

/// One row of a VHCI `status` file
#[derive(Debug, Clone)]
pub struct VhciRow {
    pub super_speed_hub: bool,
    pub port: u32,
    pub status: u32,
    pub speed: u32,
    pub dev_id: u32,
    pub sockfd: u32,
    pub local_bus_id: String,
}

impl VhciRow {
    /// Unused port (status 4)
    pub fn free(port: u32, super_speed_hub: bool) -> Self {
        Self {
            super_speed_hub,
            port,
            status: 4,
            speed: 0,
            dev_id: 0,
            sockfd: 0,
            local_bus_id: "0-0".to_string(),
        }
    }

    /// Port in use by an attached device (status 6)
    pub fn used(port: u32, super_speed_hub: bool, busnum: u32, devnum: u32) -> Self {
        Self {
            super_speed_hub,
            port,
            status: 6,
            speed: if super_speed_hub { 5 } else { 3 },
            dev_id: (busnum << 16) | devnum,
            sockfd: 3,
            local_bus_id: format!("{}-{}", if super_speed_hub { 4 } else { 3 }, port + 1),
        }
    }
}

/// Render rows in the kernel's `status` layout
pub fn vhci_status_text(rows: &[VhciRow]) -> String {
    let mut out = String::from("hub port sta spd dev      sockfd local_busid\n");
    for row in rows {
        out.push_str(&format!(
            "{}  {:04} {:03} {:03} {:08x} {:06} {}\n",
            if row.super_speed_hub { "ss" } else { "hs" },
            row.port,
            row.status,
            row.speed,
            row.dev_id,
            row.sockfd,
            row.local_bus_id
        ));
    }
    out
}

/// Fake sysfs tree rooted in a caller-provided directory
#[derive(Debug, Clone)]
pub struct SysfsFixture {
    layout: SysfsLayout,
}

impl SysfsFixture {
    /// Create the skeleton: device directory, `usbip-host` driver control
    /// files and the platform directory
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let fixture = Self {
            layout: SysfsLayout::new(root.as_ref()),
        };
        fs::create_dir_all(fixture.layout.usb_devices_dir())?;
        fs::create_dir_all(fixture.layout.platform_dir())?;
        fixture.add_driver(USBIP_HOST_DRIVER)?;
        Ok(fixture)
    }

    pub fn layout(&self) -> SysfsLayout {
        self.layout.clone()
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Create a driver directory with empty control attributes
    pub fn add_driver(&self, driver: &str) -> io::Result<PathBuf> {
        let dir = self.layout.usb_driver(driver);
        fs::create_dir_all(&dir)?;
        for attr in [
            DriverAttr::Bind,
            DriverAttr::Unbind,
            DriverAttr::Rebind,
            DriverAttr::MatchBusId,
        ] {
            fs::write(dir.join(attr.as_str()), "")?;
        }
        Ok(dir)
    }

    /// Materialize a device and its interfaces; returns the device path
    /// under `bus/usb/devices`
    pub fn add_device(&self, device: &FixtureDevice) -> io::Result<PathBuf> {
        let link = self.layout.usb_device(&device.bus_id);
        let dir = if device.under_vhci {
            self.layout
                .vhci_hcd(0)
                .join(format!("usb{}", device.busnum))
                .join(&device.bus_id)
        } else {
            link.clone()
        };
        fs::create_dir_all(&dir)?;
        if device.under_vhci {
            symlink(&dir, &link)?;
        }

        if let Some(driver) = &device.driver {
            if driver != "usb" && driver != "hub" {
                self.add_driver(driver)?;
            }
        }

        let interfaces = device.interfaces.len().to_string();
        let files: Vec<(&str, String)> = vec![
            ("uevent", device.uevent()),
            ("idVendor", format!("{:04x}\n", device.vendor_id)),
            ("idProduct", format!("{:04x}\n", device.product_id)),
            ("bcdDevice", format!("{:04x}\n", device.bcd)),
            ("bDeviceClass", format!("{:02x}\n", device.class.0)),
            ("bConfigurationValue", format!("{}\n", device.configuration_value)),
            ("bNumConfigurations", format!("{}\n", device.num_configurations)),
            ("bNumInterfaces", format!("{interfaces:>2}\n")),
            ("speed", format!("{}\n", device.speed)),
            ("busnum", format!("{}\n", device.busnum)),
            ("devnum", format!("{}\n", device.devnum)),
        ];
        for (name, content) in files {
            if !device.omit.contains(&name) {
                fs::write(dir.join(name), content)?;
            }
        }

        let strings = [
            ("serial", &device.serial),
            ("manufacturer", &device.manufacturer),
            ("product", &device.product),
        ];
        for (name, value) in strings {
            if let Some(value) = value {
                fs::write(dir.join(name), format!("{value}\n"))?;
            }
        }

        if let Some(status) = device.usbip_status {
            fs::write(dir.join("usbip_status"), format!("{status}\n"))?;
            fs::write(dir.join("usbip_sockfd"), "")?;
        }

        for (n, (class, sub_class, protocol)) in device.interfaces.iter().enumerate() {
            let iface = self.layout.usb_devices_dir().join(format!(
                "{}:{}.{}",
                device.bus_id, device.configuration_value, n
            ));
            fs::create_dir_all(&iface)?;
            fs::write(
                iface.join("uevent"),
                format!("DEVTYPE=usb_interface\nINTERFACE={class}/{sub_class}/{protocol}\n"),
            )?;
        }

        Ok(link)
    }

    /// Delete a device directory (and symlink) plus its interfaces
    pub fn remove_device(&self, bus_id: &str) -> io::Result<()> {
        let devices = self.layout.usb_devices_dir();
        let link = devices.join(bus_id);
        if link.is_symlink() {
            let target = fs::read_link(&link)?;
            fs::remove_file(&link)?;
            fs::remove_dir_all(target)?;
        } else {
            fs::remove_dir_all(&link)?;
        }

        let prefix = format!("{bus_id}:");
        for entry in fs::read_dir(&devices)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Add a root hub node such as `usb1`, which discovery must skip
    pub fn add_root_hub(&self, name: &str) -> io::Result<PathBuf> {
        let dir = self.layout.usb_devices_dir().join(name);
        fs::create_dir_all(&dir)?;
        for file in ["uevent", "idVendor", "idProduct", "bDeviceClass", "speed"] {
            fs::write(dir.join(file), "")?;
        }
        Ok(dir)
    }

    /// Create VHCI controllers; `controllers[i]` becomes the status table of
    /// `vhci_hcd.i`
    pub fn add_vhci(&self, controllers: &[Vec<VhciRow>]) -> io::Result<PathBuf> {
        let primary = self.layout.vhci_hcd(0);
        fs::create_dir_all(&primary)?;

        let nports: usize = controllers.iter().map(Vec::len).sum();
        fs::write(primary.join("nports"), format!("{nports}\n"))?;
        fs::write(primary.join("attach"), "")?;
        fs::write(primary.join("detach"), "")?;

        for (i, rows) in controllers.iter().enumerate() {
            fs::create_dir_all(self.layout.vhci_hcd(i as u32))?;
            let name = if i == 0 {
                "status".to_string()
            } else {
                format!("status.{i}")
            };
            fs::write(primary.join(name), vhci_status_text(rows))?;
        }
        Ok(primary)
    }

    /// Read a file relative to the fixture root
    pub fn read(&self, relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.root().join(relative))
    }
}

/// Run a future with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fixture_device_layout() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        let path = fixture
            .add_device(&FixtureDevice::new("5-1", 0x0951, 260).with_devnum(3))
            .unwrap();

        let uevent = fs::read_to_string(path.join("uevent")).unwrap();
        assert!(uevent.contains("PRODUCT=951/104/100"));
        assert!(uevent.contains("BUSNUM=005"));
        assert!(uevent.contains("DEVNUM=003"));
        assert!(
            fixture
                .layout()
                .usb_devices_dir()
                .join("5-1:1.0/uevent")
                .exists()
        );
    }

    #[test]
    fn test_fixture_vhci_files() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        fixture
            .add_vhci(&[
                vec![VhciRow::free(0, false), VhciRow::free(1, true)],
                vec![VhciRow::free(2, false)],
            ])
            .unwrap();

        assert_eq!(
            fixture.read("devices/platform/vhci_hcd.0/nports").unwrap(),
            "3\n"
        );
        let status = fixture
            .read("devices/platform/vhci_hcd.0/status.1")
            .unwrap();
        assert!(status.contains("hs  0002 004 000 00000000"));
        assert!(dir.path().join("devices/platform/vhci_hcd.1").is_dir());
    }

    #[test]
    fn test_remove_device_cleans_interfaces() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        fixture
            .add_device(&FixtureDevice::new("1-2", 1, 1).imported_through_vhci())
            .unwrap();
        fixture.remove_device("1-2").unwrap();

        let remaining = fs::read_dir(fixture.layout().usb_devices_dir())
            .unwrap()
            .count();
        assert_eq!(remaining, 0);
    }
}
