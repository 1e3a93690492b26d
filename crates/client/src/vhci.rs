//! VHCI port table
//!
//! The kernel's `vhci_hcd` exposes one status file per controller:
//!
//! ```text
//! hub port sta spd dev      sockfd local_busid
//! hs  0000 006 003 00030002 000005 3-1
//! hs  0001 004 000 00000000 000000 0-0
//! ss  0008 004 000 00000000 000000 0-0
//! ```
//!
//! The table is re-read for every query; the kernel changes it underneath
//! us whenever a device is attached, detached, or drops its connection.

use common::sysfs::{SysfsLayout, VHCI_HCD_PREFIX, read_attr_parsed};
use common::{Error, Result};
use protocol::{DeviceSpeed, PortStatus};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{trace, warn};

/// Root hub a VHCI port belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HubSpeed {
    /// USB 2.0 root hub; serves low, full, and high speed devices
    High,
    /// USB 3.x root hub
    Super,
}

impl HubSpeed {
    pub fn for_device(speed: DeviceSpeed) -> Self {
        if speed.is_super_family() {
            Self::Super
        } else {
            Self::High
        }
    }
}

/// One row of the VHCI status table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedDevice {
    pub hub: HubSpeed,
    pub port: u32,
    pub status: PortStatus,
    pub speed: u32,
    pub dev_id: u32,
    pub busnum: u32,
    pub devnum: u32,
    pub sockfd: u32,
    pub local_bus_id: String,
}

/// Upper bound for tables built without an `nports` value
const MAX_PORTS: usize = 4096;

/// Snapshot of every VHCI port, indexed by port number
#[derive(Debug, Clone, Default)]
pub struct VhciTable {
    ports: Vec<Option<ImportedDevice>>,
}

impl VhciTable {
    /// Read all controllers under the layout's platform directory
    pub fn read(layout: &SysfsLayout) -> Result<Self> {
        let primary = layout.vhci_hcd(0);
        if !primary.is_dir() {
            return Err(Error::parse(
                &primary,
                "vhci_hcd not found, load the vhci-hcd kernel module",
            ));
        }

        let nports: usize = read_attr_parsed(&primary.join("nports"))?;
        let mut table = Self {
            ports: vec![None; nports],
        };

        for index in 0..count_controllers(layout)? {
            let name = if index == 0 {
                "status".to_string()
            } else {
                format!("status.{index}")
            };
            let path = primary.join(name);
            let text = fs::read_to_string(&path).map_err(|e| Error::sysfs(&path, e))?;
            for row in parse_status(&path, &text)? {
                table.insert(row, nports);
            }
        }
        Ok(table)
    }

    /// Build a table from already-parsed rows
    pub fn from_rows(rows: impl IntoIterator<Item = ImportedDevice>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.insert(row, MAX_PORTS);
        }
        table
    }

    /// Rows at or beyond `limit` are dropped
    fn insert(&mut self, row: ImportedDevice, limit: usize) {
        let index = row.port as usize;
        if index >= limit {
            warn!(port = row.port, limit, "ignoring VHCI row outside the port range");
            return;
        }
        if index >= self.ports.len() {
            self.ports.resize(index + 1, None);
        }
        self.ports[index] = Some(row);
    }

    pub fn get(&self, port: u32) -> Option<&ImportedDevice> {
        self.ports.get(port as usize).and_then(Option::as_ref)
    }

    pub fn devices(&self) -> impl Iterator<Item = &ImportedDevice> {
        self.ports.iter().flatten()
    }

    /// First unused port on the root hub matching `speed`
    pub fn free_port(&self, speed: DeviceSpeed) -> Option<u32> {
        let hub = HubSpeed::for_device(speed);
        self.devices()
            .find(|d| d.hub == hub && d.status == PortStatus::Null)
            .map(|d| d.port)
    }
}

fn count_controllers(layout: &SysfsLayout) -> Result<u32> {
    let platform = layout.platform_dir();
    let prefix = format!("{VHCI_HCD_PREFIX}.");
    let count = fs::read_dir(&platform)
        .map_err(|e| Error::sysfs(&platform, e))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix(&prefix)
                .is_some_and(|n| n.parse::<u32>().is_ok())
        })
        .count();
    Ok(u32::try_from(count).unwrap_or(u32::MAX).max(1))
}

/// Parse one status file; the header line is skipped
pub fn parse_status(path: &Path, text: &str) -> Result<Vec<ImportedDevice>> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first() {
            None | Some(&"hub") | Some(&"prt") => continue,
            _ => {}
        }
        rows.push(parse_row(path, line, &fields)?);
    }
    trace!(path = %path.display(), rows = rows.len(), "parsed VHCI status");
    Ok(rows)
}

fn parse_row(path: &Path, line: &str, fields: &[&str]) -> Result<ImportedDevice> {
    let malformed = || Error::parse(path, format!("malformed VHCI status row: {line:?}"));
    let [hub, port, status, speed, dev_id, sockfd, local_bus_id] = fields else {
        return Err(malformed());
    };

    let hub = match *hub {
        "hs" => HubSpeed::High,
        "ss" => HubSpeed::Super,
        _ => return Err(malformed()),
    };
    let dev_id = u32::from_str_radix(dev_id, 16).map_err(|_| malformed())?;

    Ok(ImportedDevice {
        hub,
        port: port.parse().map_err(|_| malformed())?,
        status: PortStatus::from_u32(status.parse().map_err(|_| malformed())?),
        speed: speed.parse().map_err(|_| malformed())?,
        dev_id,
        busnum: dev_id >> 16,
        devnum: dev_id & 0xffff,
        // Some kernels print a pointer-sized value here
        sockfd: sockfd.parse().unwrap_or(0),
        local_bus_id: local_bus_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{SysfsFixture, VhciRow, vhci_status_text};
    use tempfile::TempDir;

    #[test]
    fn test_parse_status_rows() {
        let text = vhci_status_text(&[VhciRow::used(0, false, 3, 2), VhciRow::free(1, false)]);
        let rows = parse_status(Path::new("status"), &text).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hub, HubSpeed::High);
        assert_eq!(rows[0].status, PortStatus::Used);
        assert_eq!(rows[0].busnum, 3);
        assert_eq!(rows[0].devnum, 2);
        assert_eq!(rows[0].local_bus_id, "3-1");
        assert_eq!(rows[1].status, PortStatus::Null);
    }

    #[test]
    fn test_malformed_row_is_an_error() {
        let text = "hub port sta spd dev      sockfd local_busid\nhs 0000 004\n";
        assert!(parse_status(Path::new("status"), text).is_err());

        let text = "xx  0000 004 000 00000000 000000 0-0\n";
        assert!(parse_status(Path::new("status"), text).is_err());
    }

    #[test]
    fn test_free_port_by_speed_class() {
        let table = VhciTable::from_rows(
            parse_status(
                Path::new("status"),
                &vhci_status_text(&[
                    VhciRow::used(0, false, 1, 2),
                    VhciRow::used(1, false, 1, 3),
                    VhciRow::free(2, true),
                ]),
            )
            .unwrap(),
        );

        assert_eq!(table.free_port(DeviceSpeed::High), None);
        assert_eq!(table.free_port(DeviceSpeed::Low), None);
        assert_eq!(table.free_port(DeviceSpeed::Super), Some(2));
        assert_eq!(table.free_port(DeviceSpeed::SuperPlus), Some(2));
    }

    #[test]
    fn test_free_port_zero_is_returned() {
        let table = VhciTable::from_rows(
            parse_status(Path::new("status"), &vhci_status_text(&[VhciRow::free(0, false)]))
                .unwrap(),
        );
        assert_eq!(table.free_port(DeviceSpeed::Full), Some(0));
    }

    #[test]
    fn test_read_multiple_controllers() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        fixture
            .add_vhci(&[
                vec![VhciRow::used(0, false, 2, 4), VhciRow::free(1, true)],
                vec![VhciRow::free(2, false), VhciRow::free(3, true)],
            ])
            .unwrap();

        let table = VhciTable::read(&fixture.layout()).unwrap();
        assert_eq!(table.devices().count(), 4);
        assert_eq!(table.get(0).unwrap().status, PortStatus::Used);
        assert_eq!(table.get(3).unwrap().hub, HubSpeed::Super);
        assert_eq!(table.free_port(DeviceSpeed::High), Some(2));
        assert!(table.get(9).is_none());
    }

    #[test]
    fn test_table_grows_past_nports() {
        let table = VhciTable::from_rows(
            parse_status(Path::new("status"), &vhci_status_text(&[VhciRow::free(15, true)]))
                .unwrap(),
        );
        assert_eq!(table.get(15).unwrap().port, 15);
        assert!(table.get(14).is_none());
    }

    #[test]
    fn test_rows_beyond_nports_are_ignored() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        fixture
            .add_vhci(&[vec![
                VhciRow::free(0, false),
                VhciRow::free(1, false),
                VhciRow::free(2, true),
                VhciRow::free(3, true),
            ]])
            .unwrap();
        fs::write(fixture.layout().vhci_hcd(0).join("nports"), "2\n").unwrap();

        let table = VhciTable::read(&fixture.layout()).unwrap();
        assert_eq!(table.devices().count(), 2);
        assert!(table.get(2).is_none());
        assert_eq!(table.free_port(DeviceSpeed::Super), None);
    }

    #[test]
    fn test_absurd_port_number_does_not_grow_table() {
        let row = ImportedDevice {
            hub: HubSpeed::High,
            port: u32::MAX,
            status: PortStatus::Null,
            speed: 0,
            dev_id: 0,
            busnum: 0,
            devnum: 0,
            sockfd: 0,
            local_bus_id: "0-0".to_string(),
        };
        let table = VhciTable::from_rows([row]);
        assert_eq!(table.devices().count(), 0);
        assert!(table.get(u32::MAX).is_none());
    }

    #[test]
    fn test_missing_vhci_driver() {
        let dir = TempDir::new().unwrap();
        let fixture = SysfsFixture::new(dir.path()).unwrap();
        let err = VhciTable::read(&fixture.layout()).unwrap_err();
        assert!(err.to_string().contains("vhci-hcd"));
    }
}
