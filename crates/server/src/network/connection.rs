//! Per-connection USB/IP request handling
//!
//! Each accepted TCP connection is served by one [`Connection`]. Requests
//! are read as a fixed header followed by a fixed body and answered in
//! order until the peer disconnects. `OP_REQ_DEVINFO` and `OP_REQ_CRYPKEY`
//! are accepted and end the connection. A successful import is terminal: the
//! socket now belongs to the kernel and the handler only waits for shutdown,
//! keeping its descriptor open.

use common::sysfs::{SysfsLayout, read_usbip_status, write_attr};
use common::USBIP_HOST_DRIVER;
use protocol::{
    DevListReply, DeviceInfo, DeviceStatus, ExportReply, ExportRequest, ImportReply,
    ImportRequest, OpCode, OpCommon, OpStatus, ProtocolError, UnexportReply, UnexportRequest,
    read_message_async, validate_version, write_message_async,
};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binder::UsbBinder;
use crate::usb::device::UsbDevice;
use crate::usb::monitor::Monitor;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("request header carries status {0}")]
    RequestStatus(OpStatus),

    #[error("unsupported operation {0:?}")]
    UnsupportedOp(OpCode),
}

impl ConnectionError {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_eof())
    }
}

/// State shared by every connection of one daemon
pub struct DaemonContext {
    pub monitor: Arc<dyn Monitor>,
    pub binder: Option<Arc<dyn UsbBinder>>,
    pub layout: SysfsLayout,
    pub export_enabled: bool,
}

/// What a handled request means for the rest of the connection
enum Outcome {
    Continue,
    /// Nothing more will be read from this connection
    Close,
    /// The socket was handed to the kernel
    Imported,
}

/// One accepted USB/IP connection
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<DaemonContext>,
    shutdown: CancellationToken,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        context: Arc<DaemonContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer,
            context,
            shutdown,
        }
    }

    /// Serve requests until EOF, a protocol error, or shutdown
    pub async fn run(mut self) {
        info!(peer = %self.peer, "new connection established");
        let shutdown = self.shutdown.clone();

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.handle_request() => result,
            };

            match result {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Close) => break,
                Ok(Outcome::Imported) => {
                    // The kernel drives the socket now; keep it open until shutdown
                    shutdown.cancelled().await;
                    break;
                }
                Err(e) if e.is_eof() => {
                    info!(peer = %self.peer, "peer disconnected");
                    break;
                }
                Err(e) => {
                    error!(peer = %self.peer, error = %e, "closing connection");
                    break;
                }
            }
        }

        debug!(peer = %self.peer, "connection closed");
    }

    async fn handle_request(&mut self) -> Result<Outcome, ConnectionError> {
        let header: OpCommon = read_message_async(&mut self.stream).await?;
        validate_version(header.version)?;
        if !header.status.is_ok() {
            return Err(ConnectionError::RequestStatus(header.status));
        }
        debug!(peer = %self.peer, code = ?header.code, "request received");

        match header.code {
            OpCode::ReqDevList => self.handle_dev_list().await,
            OpCode::ReqImport => self.handle_import().await,
            OpCode::ReqExport => self.handle_export().await,
            OpCode::ReqUnexport => self.handle_unexport().await,
            // No reply is defined and the body length is not either, so the
            // stream cannot be resynchronised afterwards
            OpCode::ReqDevInfo | OpCode::ReqCrypkey => {
                debug!(peer = %self.peer, code = ?header.code, "ignoring request, closing");
                Ok(Outcome::Close)
            }
            other => Err(ConnectionError::UnsupportedOp(other)),
        }
    }

    async fn handle_dev_list(&mut self) -> Result<Outcome, ConnectionError> {
        let devices: Vec<DeviceInfo> = self
            .context
            .monitor
            .get_devices()
            .iter()
            .filter(|d| d.driver == USBIP_HOST_DRIVER)
            .map(UsbDevice::to_device_info)
            .collect();
        debug!(peer = %self.peer, count = devices.len(), "sending exportable devices");

        write_message_async(&mut self.stream, &DevListReply::new(devices)).await?;
        Ok(Outcome::Continue)
    }

    async fn handle_import(&mut self) -> Result<Outcome, ConnectionError> {
        let request: ImportRequest = read_message_async(&mut self.stream).await?;
        let bus_id = request.bus_id;

        let Some(device) = self.context.monitor.get_device_by_bus_id(&bus_id) else {
            info!(peer = %self.peer, bus_id = %bus_id, "import of unknown device");
            write_message_async(&mut self.stream, &ImportReply::failed(OpStatus::NoDev)).await?;
            return Ok(Outcome::Continue);
        };

        if let Err(e) = self.stream.set_nodelay(true) {
            warn!(peer = %self.peer, error = %e, "failed to set TCP_NODELAY");
        }

        let status = self.export_device(&bus_id);
        if status != OpStatus::Ok {
            warn!(peer = %self.peer, bus_id = %bus_id, %status, "import refused");
            write_message_async(&mut self.stream, &ImportReply::failed(status)).await?;
            return Ok(Outcome::Continue);
        }

        let reply = ImportReply::ok(device.to_device_info().descriptor);
        write_message_async(&mut self.stream, &reply).await?;
        info!(peer = %self.peer, bus_id = %bus_id, "device imported");
        Ok(Outcome::Imported)
    }

    /// Hand the connection's socket to `usbip-host` if the device is free
    fn export_device(&self, bus_id: &str) -> OpStatus {
        let layout = &self.context.layout;
        let status = match read_usbip_status(layout, bus_id) {
            Ok(status) => status,
            Err(e) => {
                warn!(bus_id, error = %e, "failed to read usbip_status");
                return OpStatus::Error;
            }
        };
        if status != DeviceStatus::Available {
            return status.to_op_status();
        }

        let fd = self.stream.as_raw_fd();
        match write_attr(&layout.usbip_sockfd(bus_id), format!("{fd}\n")) {
            Ok(()) => OpStatus::Ok,
            Err(e) => {
                warn!(bus_id, error = %e, "failed to hand socket to usbip-host");
                OpStatus::Na
            }
        }
    }

    async fn handle_export(&mut self) -> Result<Outcome, ConnectionError> {
        let request: ExportRequest = read_message_async(&mut self.stream).await?;
        let status = self.change_export(request.bus_id(), true).await;
        write_message_async(&mut self.stream, &ExportReply::new(status)).await?;
        Ok(Outcome::Continue)
    }

    async fn handle_unexport(&mut self) -> Result<Outcome, ConnectionError> {
        let request: UnexportRequest = read_message_async(&mut self.stream).await?;
        let status = self.change_export(request.bus_id(), false).await;
        write_message_async(&mut self.stream, &UnexportReply::new(status)).await?;
        Ok(Outcome::Continue)
    }

    /// Bind or unbind `usbip-host`; repeating the current state is a no-op
    async fn change_export(&self, bus_id: &str, export: bool) -> OpStatus {
        let binder = match &self.context.binder {
            Some(binder) if self.context.export_enabled => Arc::clone(binder),
            _ => {
                info!(peer = %self.peer, bus_id, "export requests are disabled");
                return OpStatus::Na;
            }
        };
        if self.context.monitor.get_device_by_bus_id(bus_id).is_none() {
            return OpStatus::NoDev;
        }

        let bus_id = bus_id.to_string();
        let result = tokio::task::spawn_blocking(move || {
            if binder.is_bound(&bus_id)? == export {
                return Ok(false);
            }
            if export {
                binder.bind(&bus_id)?;
            } else {
                binder.unbind(&bus_id)?;
            }
            Ok::<_, crate::binder::BindError>(true)
        })
        .await;

        match result {
            Ok(Ok(changed)) => {
                debug!(peer = %self.peer, export, changed, "export state updated");
                OpStatus::Ok
            }
            Ok(Err(e)) => {
                error!(peer = %self.peer, error = %e, "export state change failed");
                OpStatus::Error
            }
            Err(e) => {
                error!(peer = %self.peer, error = %e, "export task failed");
                OpStatus::Error
            }
        }
    }
}
