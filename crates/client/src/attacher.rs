//! Remote device import through VHCI
//!
//! Attaching performs the client half of `OP_REQ_IMPORT`, then gives the
//! connected socket to the kernel by writing `port sockfd devid speed` to
//! `vhci_hcd.0/attach`. From then on the kernel forwards URBs over the
//! socket itself.

use common::DetachedFd;
use common::sysfs::{SysfsLayout, write_attr};
use protocol::{
    Decode, DeviceDescriptor, DeviceSpeed, Encode, FixedSize, ImportReply, ImportRequest, OpCode,
    OpCommon, OpStatus, PortStatus, ProtocolError,
};
use serde::Serialize;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::net::TcpStream;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::net;
use crate::vhci::{HubSpeed, VhciTable};

/// Where per-port connection records live
pub const DEFAULT_STATE_DIR: &str = "/var/run/vhci_hcd";

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("import exchange failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("remote refused import of {bus_id}: {status}")]
    Rejected { bus_id: String, status: OpStatus },

    #[error("requested {requested} but the remote returned {returned}")]
    BusIdMismatch { requested: String, returned: String },

    #[error("no free VHCI port for {0:?} speed devices")]
    NoFreePort(DeviceSpeed),

    #[error("failed to prepare socket for the kernel: {0}")]
    Socket(#[source] io::Error),

    #[error(transparent)]
    Sysfs(#[from] common::Error),
}

#[derive(Debug, Error)]
pub enum DetachError {
    #[error("VHCI port {0} does not exist")]
    PortNotFound(u32),

    #[error("VHCI port {0} is already detached")]
    AlreadyDetached(u32),

    #[error(transparent)]
    Sysfs(#[from] common::Error),
}

/// Connection record written at attach time, `host port busid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub host: String,
    pub port: u16,
    pub bus_id: String,
}

impl ConnectionRecord {
    fn parse(text: &str) -> Option<Self> {
        let mut fields = text.split_whitespace();
        let record = Self {
            host: fields.next()?.to_string(),
            port: fields.next()?.parse().ok()?,
            bus_id: fields.next()?.to_string(),
        };
        Some(record)
    }
}

/// An attached VHCI port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachInfo {
    pub port: u32,
    pub hub: HubSpeed,
    pub busnum: u32,
    pub devnum: u32,
    pub local_bus_id: String,
    /// Present when this process family attached the port
    pub remote: Option<ConnectionRecord>,
}

/// Client-side import control
pub trait UsbAttacher: Send + Sync {
    /// Import `bus_id` from the daemon at `host:port`; returns the VHCI port
    fn attach(&self, host: &str, bus_id: &str, port: u16) -> Result<u32, AttachError>;
    fn detach(&self, rhport: u32) -> Result<(), DetachError>;
    fn get_attach_info(&self) -> common::Result<Vec<AttachInfo>>;
}

/// [`UsbAttacher`] driving `vhci_hcd` through sysfs
#[derive(Debug)]
pub struct SysfsAttacher {
    layout: SysfsLayout,
    state_dir: PathBuf,
    connect_timeout: Duration,
    lock: Mutex<()>,
}

impl SysfsAttacher {
    pub fn new(
        layout: SysfsLayout,
        state_dir: impl Into<PathBuf>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            layout,
            state_dir: state_dir.into(),
            connect_timeout,
            lock: Mutex::new(()),
        }
    }

    fn record_path(&self, rhport: u32) -> PathBuf {
        self.state_dir.join(format!("port{rhport}"))
    }

    fn write_record(&self, rhport: u32, record: &ConnectionRecord) -> io::Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.state_dir)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(self.record_path(rhport))?;
        writeln!(file, "{} {} {}", record.host, record.port, record.bus_id)
    }

    fn read_record(&self, rhport: u32) -> Option<ConnectionRecord> {
        let text = fs::read_to_string(self.record_path(rhport)).ok()?;
        ConnectionRecord::parse(&text)
    }

    fn remove_record(&self, rhport: u32) {
        let path = self.record_path(rhport);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove connection record"),
        }
        // Only succeeds once the last record is gone
        let _ = fs::remove_dir(&self.state_dir);
    }

    /// Perform the import exchange on an open connection
    fn import(
        &self,
        stream: &mut TcpStream,
        bus_id: &str,
    ) -> Result<DeviceDescriptor, AttachError> {
        let mut request = Vec::with_capacity(OpCommon::SIZE + ImportRequest::SIZE);
        OpCommon::request(OpCode::ReqImport).encode(&mut request)?;
        ImportRequest::new(bus_id).encode(&mut request)?;
        stream.write_all(&request).map_err(ProtocolError::from)?;

        let device = ImportReply::decode(stream)?
            .into_result()
            .map_err(|status| AttachError::Rejected {
                bus_id: bus_id.to_string(),
                status,
            })?;
        if device.bus_id != bus_id {
            return Err(AttachError::BusIdMismatch {
                requested: bus_id.to_string(),
                returned: device.bus_id,
            });
        }
        Ok(device)
    }
}

impl UsbAttacher for SysfsAttacher {
    fn attach(&self, host: &str, bus_id: &str, port: u16) -> Result<u32, AttachError> {
        let mut stream =
            net::connect(host, port, self.connect_timeout).map_err(|source| AttachError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;
        let device = self.import(&mut stream, bus_id)?;
        debug!(bus_id, speed = ?device.speed, "remote accepted import");

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let rhport = VhciTable::read(&self.layout)?
            .free_port(device.speed)
            .ok_or(AttachError::NoFreePort(device.speed))?;

        net::clear_timeouts(&stream).map_err(AttachError::Socket)?;
        let socket = DetachedFd::duplicate(&stream).map_err(AttachError::Socket)?;
        let attach = self.layout.vhci_hcd(0).join("attach");
        let dev_id = device.dev_id();
        let speed = device.speed.as_u32();
        socket.hand_over(|fd| write_attr(&attach, format!("{rhport} {fd} {dev_id} {speed}")))?;
        drop(stream);

        let record = ConnectionRecord {
            host: host.to_string(),
            port,
            bus_id: bus_id.to_string(),
        };
        if let Err(e) = self.write_record(rhport, &record) {
            warn!(port = rhport, error = %e, "failed to write connection record");
        }

        info!(host, bus_id, port = rhport, "device attached");
        Ok(rhport)
    }

    fn detach(&self, rhport: u32) -> Result<(), DetachError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let table = VhciTable::read(&self.layout)?;
        let entry = table.get(rhport).ok_or(DetachError::PortNotFound(rhport))?;
        if entry.status == PortStatus::Null {
            return Err(DetachError::AlreadyDetached(rhport));
        }

        self.remove_record(rhport);
        write_attr(&self.layout.vhci_hcd(0).join("detach"), rhport)?;

        info!(port = rhport, "device detached");
        Ok(())
    }

    fn get_attach_info(&self) -> common::Result<Vec<AttachInfo>> {
        let table = VhciTable::read(&self.layout)?;
        Ok(table
            .devices()
            .filter(|d| d.status == PortStatus::Used)
            .map(|d| AttachInfo {
                port: d.port,
                hub: d.hub,
                busnum: d.busnum,
                devnum: d.devnum,
                local_bus_id: d.local_bus_id.clone(),
                remote: self.read_record(d.port),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_parse() {
        assert_eq!(
            ConnectionRecord::parse("10.0.0.5 3240 3-2.1\n"),
            Some(ConnectionRecord {
                host: "10.0.0.5".to_string(),
                port: 3240,
                bus_id: "3-2.1".to_string(),
            })
        );
        assert_eq!(ConnectionRecord::parse("10.0.0.5 notaport 1-1"), None);
        assert_eq!(ConnectionRecord::parse(""), None);
    }
}
