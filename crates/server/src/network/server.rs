//! USB/IP TCP server
//!
//! Accepts connections up to a configured cap and spawns one [`Connection`]
//! task per peer. On shutdown the listener is closed first, then in-flight
//! connections get a bounded grace period.

use common::sysfs::SysfsLayout;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, DaemonContext};
use crate::binder::UsbBinder;
use crate::usb::monitor::Monitor;

/// Backoff after a failed accept, e.g. when out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonOptions {
    pub max_connections: usize,
    pub graceful_shutdown_timeout: Duration,
    /// Honour export/unexport requests from peers
    pub export_enabled: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            max_connections: 100,
            graceful_shutdown_timeout: Duration::from_secs(30),
            export_enabled: false,
        }
    }
}

/// Decrements the active connection count when a handler finishes
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// USB/IP daemon serving device list, import, and export requests
pub struct UsbIpDaemon {
    listener: TcpListener,
    context: Arc<DaemonContext>,
    options: DaemonOptions,
}

impl UsbIpDaemon {
    /// Bind the listening socket
    pub async fn bind(
        addr: impl ToSocketAddrs,
        monitor: Arc<dyn Monitor>,
        binder: Option<Arc<dyn UsbBinder>>,
        layout: SysfsLayout,
        options: DaemonOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context: Arc::new(DaemonContext {
                monitor,
                binder,
                layout,
                export_enabled: options.export_enabled,
            }),
            options,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            listener,
            context,
            options,
        } = self;
        let tracker = TaskTracker::new();
        let active = Arc::new(AtomicUsize::new(0));

        match listener.local_addr() {
            Ok(addr) => info!("USB/IP daemon listening on {}", addr),
            Err(e) => warn!(error = %e, "USB/IP daemon listening on unknown address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if active.load(Ordering::SeqCst) >= options.max_connections {
                warn!(
                    peer = %peer,
                    max = options.max_connections,
                    "connection limit reached, rejecting"
                );
                drop(stream);
                continue;
            }

            active.fetch_add(1, Ordering::SeqCst);
            let guard = ActiveGuard(Arc::clone(&active));
            let connection =
                Connection::new(stream, peer, Arc::clone(&context), shutdown.clone());
            tracker.spawn(async move {
                let _guard = guard;
                connection.run().await;
            });
        }

        drop(listener);
        tracker.close();
        info!(
            active = active.load(Ordering::SeqCst),
            "USB/IP daemon stopping, waiting for connections"
        );

        if tokio::time::timeout(options.graceful_shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout = ?options.graceful_shutdown_timeout,
                "connections still active after grace period"
            );
        } else {
            debug!("all connections closed");
        }
    }
}
