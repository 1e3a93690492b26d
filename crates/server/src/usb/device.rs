//! USB device model and sysfs parser
//!
//! A [`UsbDevice`] is a snapshot of one device directory under
//! `/sys/bus/usb/devices`. It is loaded in one pass and replaced wholesale
//! whenever the device changes.

use common::sysfs::{SysfsLayout, read_attr};
use common::{Error, Result};
use protocol::{DeviceDescriptor, DeviceInfo, DeviceSpeed, InterfaceDescriptor};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `bDeviceClass` of a USB hub
pub const HUB_CLASS: u8 = 0x09;

/// Interface class triple from an interface's `uevent`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsbInterface {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
}

/// Physical USB device as described by sysfs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    /// Sysfs directory, e.g. `/sys/bus/usb/devices/3-2.1`
    pub path: PathBuf,
    pub bus_id: String,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
    /// Character device node, e.g. `/dev/bus/usb/003/002`
    pub device_path: PathBuf,
    pub driver: String,
    pub is_hub: bool,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd: u16,
    pub bus: u32,
    pub device_number: u32,
    pub speed: DeviceSpeed,
    pub major: u64,
    pub minor: u64,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    /// Check that every property needed to publish the device is set
    pub fn validate(&self) -> Result<()> {
        let missing = if self.vendor_id == 0 {
            "vendor id"
        } else if self.product_id == 0 {
            "product id"
        } else if self.bus == 0 {
            "bus number"
        } else if self.device_number == 0 {
            "device number"
        } else if self.device_path.as_os_str().is_empty() {
            "device path"
        } else if self.major == 0 {
            "major number"
        } else if self.minor == 0 {
            "minor number"
        } else {
            return Ok(());
        };

        Err(Error::Validation {
            bus_id: self.bus_id.clone(),
            message: format!("{missing} is required"),
        })
    }

    /// Wire representation used in device list and import replies
    ///
    /// The interface count is the device's `bNumInterfaces`. Interface
    /// records are truncated or zero-padded to match it.
    pub fn to_device_info(&self) -> DeviceInfo {
        let declared = usize::from(self.num_interfaces);
        if self.interfaces.len() != declared {
            debug!(
                bus_id = %self.bus_id,
                declared,
                found = self.interfaces.len(),
                "interface directories disagree with bNumInterfaces"
            );
        }
        let interfaces: Vec<InterfaceDescriptor> = self
            .interfaces
            .iter()
            .map(|iface| InterfaceDescriptor {
                class: iface.class,
                sub_class: iface.sub_class,
                protocol: iface.protocol,
            })
            .chain(std::iter::repeat(InterfaceDescriptor::default()))
            .take(declared)
            .collect();

        DeviceInfo {
            descriptor: DeviceDescriptor {
                path: self.device_path.to_string_lossy().into_owned(),
                bus_id: self.bus_id.clone(),
                busnum: self.bus,
                devnum: self.device_number,
                speed: self.speed,
                id_vendor: self.vendor_id,
                id_product: self.product_id,
                bcd_device: self.bcd,
                b_device_class: self.device_class,
                b_device_sub_class: self.device_sub_class,
                b_device_protocol: self.device_protocol,
                b_configuration_value: self.configuration_value,
                b_num_configurations: self.num_configurations,
                b_num_interfaces: self.num_interfaces,
            },
            interfaces,
        }
    }
}

/// Load one device from its sysfs directory
///
/// `path` must live under the layout's `bus/usb/devices` directory.
pub fn load_usb_device(layout: &SysfsLayout, path: &Path) -> Result<UsbDevice> {
    if !path.starts_with(layout.usb_devices_dir()) {
        return Err(Error::parse(path, "not a USB device path"));
    }
    let bus_id = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::parse(path, "missing bus id"))?;

    let mut device = UsbDevice {
        path: path.to_path_buf(),
        bus_id,
        ..Default::default()
    };

    parse_uevent(path, &mut device)?;
    device.serial = read_optional_string(path, "serial")?;
    device.manufacturer = read_optional_string(path, "manufacturer")?;
    device.product = read_optional_string(path, "product")?;
    device.configuration_value = read_u8_attr(path, "bConfigurationValue", true)?;
    device.num_configurations = read_u8_attr(path, "bNumConfigurations", false)?;
    device.num_interfaces = read_u8_attr(path, "bNumInterfaces", true)?;
    device.speed = DeviceSpeed::from_sysfs(&read_attr(&path.join("speed"))?);
    device.interfaces = parse_interfaces(path, &device)?;

    Ok(device)
}

// Example device uevent:
//   MAJOR=189
//   MINOR=257
//   DEVNAME=bus/usb/003/002
//   DEVTYPE=usb_device
//   DRIVER=usb
//   PRODUCT=e39/f100/35d
//   TYPE=0/0/0
//   BUSNUM=003
//   DEVNUM=002
fn parse_uevent(dir: &Path, device: &mut UsbDevice) -> Result<()> {
    let path = dir.join("uevent");
    let content = fs::read_to_string(&path).map_err(|e| Error::sysfs(&path, e))?;

    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "skipping uevent line that is not key=value");
            continue;
        };

        match key {
            "MAJOR" => device.major = parse_dec(&path, key, value)?,
            "MINOR" => device.minor = parse_dec(&path, key, value)?,
            "DEVNAME" => device.device_path = Path::new("/dev").join(value),
            "DRIVER" => device.driver = value.to_string(),
            "PRODUCT" => {
                let [vendor, product, bcd] = split_triple(&path, key, value)?;
                device.vendor_id = parse_hex(&path, key, vendor)?;
                device.product_id = parse_hex(&path, key, product)?;
                device.bcd = parse_hex(&path, key, bcd)?;
            }
            "TYPE" => {
                let [class, sub_class, protocol] = split_triple(&path, key, value)?;
                device.device_class = parse_dec(&path, key, class)?;
                device.device_sub_class = parse_dec(&path, key, sub_class)?;
                device.device_protocol = parse_dec(&path, key, protocol)?;
                device.is_hub = device.device_class == HUB_CLASS;
            }
            "BUSNUM" => device.bus = parse_dec(&path, key, value)?,
            "DEVNUM" => device.device_number = parse_dec(&path, key, value)?,
            _ => {}
        }
    }
    Ok(())
}

// Interface directories are siblings named <busid>:<config>.<number>
fn parse_interfaces(dir: &Path, device: &UsbDevice) -> Result<Vec<UsbInterface>> {
    if device.configuration_value == 0 || device.num_interfaces == 0 {
        return Ok(Vec::new());
    }

    let parent = dir
        .parent()
        .ok_or_else(|| Error::parse(dir, "device path has no parent"))?;
    let entries = fs::read_dir(parent).map_err(|e| Error::sysfs(parent, e))?;
    let prefix = format!("{}:{}.", device.bus_id, device.configuration_value);

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::sysfs(parent, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(number) = name
            .strip_prefix(&prefix)
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let iface_dir = entry.path();
        if !iface_dir.is_dir() {
            continue;
        }

        let uevent = iface_dir.join("uevent");
        let content = fs::read_to_string(&uevent).map_err(|e| Error::sysfs(&uevent, e))?;
        let value = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .find_map(|(key, value)| (key == "INTERFACE").then_some(value));
        if let Some(value) = value {
            let [class, sub_class, protocol] = split_triple(&uevent, "INTERFACE", value)?;
            found.push((
                number,
                UsbInterface {
                    class: parse_dec(&uevent, "INTERFACE", class)?,
                    sub_class: parse_dec(&uevent, "INTERFACE", sub_class)?,
                    protocol: parse_dec(&uevent, "INTERFACE", protocol)?,
                },
            ));
        }
    }

    found.sort_by_key(|(number, _)| *number);
    Ok(found.into_iter().map(|(_, iface)| iface).collect())
}

fn read_optional_string(dir: &Path, name: &str) -> Result<String> {
    match read_attr(&dir.join(name)) {
        Ok(value) => Ok(value),
        Err(e) if e.is_not_found() => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Numeric descriptor attribute. An explicit `0` is rejected; an empty
/// value is read as 0 only when `allow_empty` is set.
fn read_u8_attr(dir: &Path, name: &str, allow_empty: bool) -> Result<u8> {
    let path = dir.join(name);
    let value = read_attr(&path)?;
    if value.is_empty() && allow_empty {
        return Ok(0);
    }

    let parsed: u8 = value
        .parse()
        .map_err(|e| Error::parse(&path, format!("{name} {value:?}: {e}")))?;
    if parsed == 0 {
        return Err(Error::parse(&path, format!("invalid {name}: 0")));
    }
    Ok(parsed)
}

fn split_triple<'a>(path: &Path, key: &str, value: &'a str) -> Result<[&'a str; 3]> {
    let parts: Vec<&str> = value.split('/').collect();
    <[&str; 3]>::try_from(parts)
        .map_err(|_| Error::parse(path, format!("malformed {key}: {value:?}")))
}

fn parse_dec<T: std::str::FromStr>(path: &Path, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::parse(path, format!("malformed {key}: {value:?}")))
}

fn parse_hex(path: &Path, key: &str, value: &str) -> Result<u16> {
    u16::from_str_radix(value, 16)
        .map_err(|_| Error::parse(path, format!("malformed {key}: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{FixtureDevice, SysfsFixture};
    use protocol::Encode;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SysfsFixture) {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        (dir, fixture)
    }

    #[test]
    fn test_load_device() {
        let (_dir, fixture) = fixture();
        let path = fixture
            .add_device(
                &FixtureDevice::new("3-2.1", 0x0951, 0x1666)
                    .with_devnum(7)
                    .with_speed("480"),
            )
            .unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        assert_eq!(device.bus_id, "3-2.1");
        assert_eq!(device.vendor_id, 0x0951);
        assert_eq!(device.product_id, 0x1666);
        assert_eq!(device.bcd, 0x0100);
        assert_eq!(device.bus, 3);
        assert_eq!(device.device_number, 7);
        assert_eq!(device.major, 189);
        assert_eq!(device.device_path, PathBuf::from("/dev/bus/usb/003/007"));
        assert_eq!(device.driver, "usb");
        assert_eq!(device.speed, DeviceSpeed::High);
        assert_eq!(device.configuration_value, 1);
        assert_eq!(device.num_interfaces, 1);
        assert_eq!(
            device.interfaces,
            vec![UsbInterface {
                class: 8,
                sub_class: 6,
                protocol: 80
            }]
        );
        assert!(!device.is_hub);
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_interfaces_sorted_numerically() {
        let (_dir, fixture) = fixture();
        let interfaces: Vec<_> = (0..12).map(|n| (n, 0, 0)).collect();
        let path = fixture
            .add_device(&FixtureDevice::new("1-1", 1, 1).with_interfaces(interfaces))
            .unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        let classes: Vec<u8> = device.interfaces.iter().map(|i| i.class).collect();
        assert_eq!(classes, (0..12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_unconfigured_device_has_no_interfaces() {
        let (_dir, fixture) = fixture();
        let mut template = FixtureDevice::new("1-3", 1, 1);
        template.configuration_value = String::new();
        let path = fixture.add_device(&template).unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        assert_eq!(device.configuration_value, 0);
        assert!(device.interfaces.is_empty());
    }

    #[test]
    fn test_explicit_zero_is_rejected() {
        let (_dir, fixture) = fixture();
        let mut template = FixtureDevice::new("1-4", 1, 1);
        template.num_configurations = "0".to_string();
        let path = fixture.add_device(&template).unwrap();

        let err = load_usb_device(&fixture.layout(), &path).unwrap_err();
        assert!(err.to_string().contains("bNumConfigurations"));
    }

    #[test]
    fn test_empty_num_configurations_is_rejected() {
        let (_dir, fixture) = fixture();
        let mut template = FixtureDevice::new("1-5", 1, 1);
        template.num_configurations = String::new();
        let path = fixture.add_device(&template).unwrap();

        assert!(load_usb_device(&fixture.layout(), &path).is_err());
    }

    #[test]
    fn test_hub_detection() {
        let (_dir, fixture) = fixture();
        let path = fixture
            .add_device(&FixtureDevice::new("2-1", 0x05e3, 0x0608).hub())
            .unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        assert!(device.is_hub);
        assert_eq!(device.device_class, HUB_CLASS);
    }

    #[test]
    fn test_missing_strings_are_empty() {
        let (_dir, fixture) = fixture();
        let mut template = FixtureDevice::new("1-6", 1, 1);
        template.serial = None;
        template.manufacturer = None;
        let path = fixture.add_device(&template).unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        assert!(device.serial.is_empty());
        assert!(device.manufacturer.is_empty());
        assert_eq!(device.product, "Test Product");
    }

    #[test]
    fn test_path_outside_usb_tree() {
        let (dir, fixture) = fixture();
        let err = load_usb_device(&fixture.layout(), &dir.path().join("elsewhere")).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_validate_requires_fields() {
        let device = UsbDevice {
            bus_id: "1-1".to_string(),
            vendor_id: 1,
            product_id: 1,
            bus: 1,
            device_number: 1,
            device_path: PathBuf::from("/dev/bus/usb/001/001"),
            major: 189,
            minor: 0,
            ..Default::default()
        };
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("minor number is required"));
    }

    #[test]
    fn test_device_info_reports_num_interfaces_attribute() {
        let hid = UsbInterface {
            class: 3,
            sub_class: 1,
            protocol: 1,
        };
        let device = UsbDevice {
            num_interfaces: 3,
            interfaces: vec![hid],
            ..Default::default()
        };
        let info = device.to_device_info();
        assert_eq!(info.descriptor.b_num_interfaces, 3);
        assert_eq!(info.interfaces.len(), 3);
        assert_eq!(info.interfaces[0].class, 3);
        assert_eq!(info.interfaces[2], InterfaceDescriptor::default());

        let device = UsbDevice {
            num_interfaces: 1,
            interfaces: vec![hid, UsbInterface::default()],
            ..Default::default()
        };
        let info = device.to_device_info();
        assert_eq!(info.descriptor.b_num_interfaces, 1);
        assert_eq!(info.interfaces.len(), 1);
        // Always encodable
        info.encode(&mut Vec::new()).unwrap();
    }

    #[test]
    fn test_loaded_device_info_uses_sysfs_count() {
        let (_dir, fixture) = fixture();
        let path = fixture
            .add_device(&FixtureDevice::new("1-1", 1, 1).with_interfaces(vec![(3, 1, 1), (3, 0, 0)]))
            .unwrap();
        fs::write(path.join("bNumInterfaces"), " 3\n").unwrap();

        let device = load_usb_device(&fixture.layout(), &path).unwrap();
        let info = device.to_device_info();
        assert_eq!(info.descriptor.b_num_interfaces, 3);
        assert_eq!(info.interfaces.len(), 3);
    }
}
