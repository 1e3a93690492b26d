//! Udev monitor
//!
//! Keeps the [`DeviceStore`] in sync with the kernel. Uevents are debounced
//! per device path: a burst of events for one device results in a single
//! reload once the burst has been quiet for the debounce window. A periodic
//! full rescan repairs anything missed while the event socket overran.

use async_channel::Receiver;
use common::sysfs::SysfsLayout;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::{UsbDevice, load_usb_device};
use super::discovery::{discover_plugged_usb_devices, is_usb_path};
use super::store::DeviceStore;
use super::uevent::{Action, UEvent, UeventSource};

/// Read access to the current device set
pub trait Monitor: Send + Sync {
    fn get_devices(&self) -> Vec<UsbDevice>;
    fn get_device(&self, path: &Path) -> Option<UsbDevice>;
    fn get_device_by_bus_id(&self, bus_id: &str) -> Option<UsbDevice>;
    /// Coalesced "something changed" notifications
    fn device_changes(&self) -> Receiver<()>;
}

/// Timing knobs for [`UdevMonitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Interval between full rescans
    pub resync_period: Duration,
    /// Quiet time required before a device's pending event is processed
    pub debounce: Duration,
    /// Extra delay before reading sysfs after an add, while attributes appear
    pub settle: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(300),
            debounce: Duration::from_millis(200),
            settle: Duration::from_millis(50),
        }
    }
}

struct PendingEvent {
    action: Action,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Inner {
    store: DeviceStore,
    layout: SysfsLayout,
    options: MonitorOptions,
    pending: Mutex<HashMap<PathBuf, PendingEvent>>,
    next_generation: AtomicU64,
}

/// Device monitor driven by kernel uevents
#[derive(Clone)]
pub struct UdevMonitor {
    inner: Arc<Inner>,
}

impl UdevMonitor {
    /// Create the monitor and populate the store with an initial scan
    pub fn new(layout: SysfsLayout, options: MonitorOptions) -> common::Result<Self> {
        let store = DeviceStore::new();
        let devices = discover_plugged_usb_devices(&layout)?;
        info!(count = devices.len(), "initial USB device scan complete");
        store.resync(devices);

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                layout,
                options,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn store(&self) -> &DeviceStore {
        &self.inner.store
    }

    /// Start consuming `source` until `shutdown` fires or the source ends
    ///
    /// On exit pending debounce timers are dropped and the change channel
    /// is closed.
    pub fn spawn<S>(&self, source: S, shutdown: CancellationToken) -> JoinHandle<()>
    where
        S: UeventSource + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run(&inner, source, shutdown).await;
            inner.cancel_pending();
            inner.store.close();
            debug!("udev monitor stopped");
        })
    }
}

impl Monitor for UdevMonitor {
    fn get_devices(&self) -> Vec<UsbDevice> {
        self.inner.store.get_devices()
    }

    fn get_device(&self, path: &Path) -> Option<UsbDevice> {
        self.inner.store.get_device(path)
    }

    fn get_device_by_bus_id(&self, bus_id: &str) -> Option<UsbDevice> {
        self.inner.store.get_device_by_bus_id(bus_id)
    }

    fn device_changes(&self) -> Receiver<()> {
        self.inner.store.changes()
    }
}

async fn run<S: UeventSource>(inner: &Arc<Inner>, mut source: S, shutdown: CancellationToken) {
    let period = inner.options.resync_period;
    let mut resync = interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("udev monitor shutting down");
                return;
            }
            event = source.next_event() => match event {
                Ok(Some(event)) => inner.handle_event(event),
                Ok(None) => {
                    info!("uevent source closed");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "uevent source failed");
                    return;
                }
            },
            _ = resync.tick() => inner.resync(),
        }
    }
}

impl Inner {
    fn handle_event(self: &Arc<Self>, event: UEvent) {
        if !event.is_usb_device() {
            return;
        }
        let Some(bus_id) = event.bus_id() else {
            return;
        };
        let path = self.layout.usb_device(bus_id);
        debug!(action = ?event.action, bus_id, "uevent received");
        self.schedule(path, event.action);
    }

    /// Debounce: replace any pending timer for `path`. A pending remove is
    /// never downgraded by later events in the same window.
    fn schedule(self: &Arc<Self>, path: PathBuf, action: Action) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let action = match pending.remove(&path) {
            Some(previous) => {
                previous.timer.abort();
                if previous.action == Action::Remove || action == Action::Move {
                    previous.action
                } else {
                    action
                }
            }
            None => action,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let timer_path = path.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.options.debounce).await;
            inner.fire(timer_path, generation).await;
        });

        pending.insert(
            path,
            PendingEvent {
                action,
                generation,
                timer,
            },
        );
    }

    async fn fire(&self, path: PathBuf, generation: u64) {
        let action = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get(&path) {
                Some(entry) if entry.generation == generation => {
                    let action = entry.action;
                    pending.remove(&path);
                    action
                }
                // Superseded by a newer event
                _ => return,
            }
        };
        self.process(&path, action).await;
    }

    async fn process(&self, path: &Path, action: Action) {
        if action.is_absence() {
            if self.store.remove_device(path) {
                info!(path = %path.display(), "USB device removed");
            }
            return;
        }
        if !action.is_presence() {
            return;
        }

        tokio::time::sleep(self.options.settle).await;
        match self.load(path) {
            Ok(Some(device)) => {
                let bus_id = device.bus_id.clone();
                if self.store.add_device(device) {
                    info!(bus_id = %bus_id, "USB device updated");
                }
            }
            Ok(None) => {
                if self.store.remove_device(path) {
                    info!(path = %path.display(), "USB device gone before it could be loaded");
                }
            }
            Err(e) => debug!(path = %path.display(), error = %e, "failed to load USB device"),
        }
    }

    fn load(&self, path: &Path) -> common::Result<Option<UsbDevice>> {
        if !path.exists() || !is_usb_path(path) {
            return Ok(None);
        }
        let device = load_usb_device(&self.layout, path)?;
        device.validate()?;
        Ok(Some(device))
    }

    fn resync(&self) {
        match discover_plugged_usb_devices(&self.layout) {
            Ok(devices) => {
                if self.store.resync(devices) {
                    info!("periodic resync updated devices");
                }
            }
            Err(e) => warn!(error = %e, "periodic resync failed"),
        }
    }

    fn cancel_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}
