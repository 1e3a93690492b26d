//! Export negotiation and device listing against a peer daemon

use protocol::{
    Decode, DevListReply, DeviceInfo, Encode, ExportReply, ExportRequest, OpCode, OpCommon,
    OpStatus, ProtocolError, UnexportReply, UnexportRequest,
};
use std::io::{self, Write};
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::net;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("request failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("remote refused {op} of {bus_id}: {status}")]
    Rejected {
        op: &'static str,
        bus_id: String,
        status: OpStatus,
    },
}

/// Asks a peer daemon to start or stop offering one of its devices
pub trait UsbExporter: Send + Sync {
    fn export(&self, host: &str, port: u16, bus_id: &str) -> Result<(), ExportError>;
    fn unexport(&self, host: &str, port: u16, bus_id: &str) -> Result<(), ExportError>;
}

/// [`UsbExporter`] speaking USB/IP over a short-lived TCP connection
#[derive(Debug, Clone)]
pub struct TcpExporter {
    connect_timeout: Duration,
}

impl TcpExporter {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ExportError> {
        connect(host, port, self.connect_timeout)
    }
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ExportError> {
    net::connect(host, port, timeout).map_err(|source| ExportError::Connect {
        host: host.to_string(),
        port,
        source,
    })
}

fn send_request(stream: &mut TcpStream, code: OpCode, body: &impl Encode) -> Result<(), ExportError> {
    let mut request = Vec::new();
    OpCommon::request(code).encode(&mut request)?;
    body.encode(&mut request)?;
    stream.write_all(&request).map_err(ProtocolError::from)?;
    Ok(())
}

fn check_status(op: &'static str, bus_id: &str, status: OpStatus) -> Result<(), ExportError> {
    if status.is_ok() {
        return Ok(());
    }
    Err(ExportError::Rejected {
        op,
        bus_id: bus_id.to_string(),
        status,
    })
}

impl UsbExporter for TcpExporter {
    fn export(&self, host: &str, port: u16, bus_id: &str) -> Result<(), ExportError> {
        let mut stream = self.connect(host, port)?;
        send_request(&mut stream, OpCode::ReqExport, &ExportRequest::new(bus_id))?;
        let reply = ExportReply::decode(&mut stream)?;
        debug!(bus_id, status = %reply.status, code = reply.return_code, "export reply");
        check_status("export", bus_id, reply.status)?;

        info!(host, bus_id, "remote device exported");
        Ok(())
    }

    fn unexport(&self, host: &str, port: u16, bus_id: &str) -> Result<(), ExportError> {
        let mut stream = self.connect(host, port)?;
        send_request(&mut stream, OpCode::ReqUnexport, &UnexportRequest::new(bus_id))?;
        let reply = UnexportReply::decode(&mut stream)?;
        debug!(bus_id, status = %reply.status, code = reply.return_code, "unexport reply");
        check_status("unexport", bus_id, reply.status)?;

        info!(host, bus_id, "remote device unexported");
        Ok(())
    }
}

/// Fetch the devices a peer daemon currently offers for import
pub fn list_remote_devices(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<Vec<DeviceInfo>, ExportError> {
    let mut stream = connect(host, port, timeout)?;
    OpCommon::request(OpCode::ReqDevList).encode(&mut stream)?;
    let reply = DevListReply::decode(&mut stream)?;
    check_status("device list", "*", reply.status)?;
    Ok(reply.devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{DeviceDescriptor, DeviceSpeed, InterfaceDescriptor};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serve exactly one connection with `handler`
    fn fake_daemon<F>(handler: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream);
        });
        (port, handle)
    }

    fn exporter() -> TcpExporter {
        TcpExporter::new(Duration::from_secs(2))
    }

    #[test]
    fn test_export_sends_bus_id() {
        let (port, handle) = fake_daemon(|mut stream| {
            OpCommon::decode_expecting(&mut stream, OpCode::ReqExport).unwrap();
            let request = ExportRequest::decode(&mut stream).unwrap();
            assert_eq!(request.bus_id(), "2-4");
            ExportReply::new(OpStatus::Ok).encode(&mut stream).unwrap();
        });

        exporter().export("127.0.0.1", port, "2-4").unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_unexport_rejection_carries_status() {
        let (port, handle) = fake_daemon(|mut stream| {
            OpCommon::decode_expecting(&mut stream, OpCode::ReqUnexport).unwrap();
            UnexportRequest::decode(&mut stream).unwrap();
            UnexportReply::new(OpStatus::NoDev).encode(&mut stream).unwrap();
        });

        let err = exporter().unexport("127.0.0.1", port, "9-9").unwrap_err();
        assert!(matches!(
            err,
            ExportError::Rejected {
                op: "unexport",
                status: OpStatus::NoDev,
                ..
            }
        ));
        handle.join().unwrap();
    }

    #[test]
    fn test_list_remote_devices() {
        let (port, handle) = fake_daemon(|mut stream| {
            OpCommon::decode_expecting(&mut stream, OpCode::ReqDevList).unwrap();
            let device = DeviceInfo {
                descriptor: DeviceDescriptor {
                    bus_id: "1-1".to_string(),
                    busnum: 1,
                    devnum: 5,
                    speed: DeviceSpeed::Full,
                    id_vendor: 0x046d,
                    id_product: 0xc52b,
                    b_num_configurations: 1,
                    b_num_interfaces: 1,
                    ..Default::default()
                },
                interfaces: vec![InterfaceDescriptor {
                    class: 3,
                    sub_class: 1,
                    protocol: 2,
                }],
            };
            DevListReply::new(vec![device]).encode(&mut stream).unwrap();
        });

        let devices = list_remote_devices("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].descriptor.id_product, 0xc52b);
        assert_eq!(devices[0].interfaces[0].class, 3);
        handle.join().unwrap();
    }

    #[test]
    fn test_peer_closing_early_is_a_protocol_error() {
        let (port, handle) = fake_daemon(drop);

        let err = exporter().export("127.0.0.1", port, "1-1").unwrap_err();
        assert!(matches!(err, ExportError::Protocol(_)));
        handle.join().unwrap();
    }
}
