//! Device store with change notifications
//!
//! Subscribers share a single-slot channel: any number of mutations between
//! two reads collapse into one pending notification.

use async_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, trace};

use super::device::UsbDevice;
use super::monitor::Monitor;

/// Thread-safe map of plugged devices keyed by sysfs path
#[derive(Debug)]
pub struct DeviceStore {
    devices: RwLock<HashMap<PathBuf, UsbDevice>>,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
    closed: AtomicBool,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = async_channel::bounded(1);
        Self {
            devices: RwLock::new(HashMap::new()),
            notify_tx,
            notify_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Insert or replace a device; notifies only when the stored value changed
    pub fn add_device(&self, device: UsbDevice) -> bool {
        let changed = {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            match devices.get(&device.path) {
                Some(existing) if *existing == device => false,
                _ => {
                    debug!(bus_id = %device.bus_id, "device stored");
                    devices.insert(device.path.clone(), device);
                    true
                }
            }
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Remove the device at `path`; notifies only if it was present
    pub fn remove_device(&self, path: &Path) -> bool {
        let removed = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some();
        if removed {
            debug!(path = %path.display(), "device removed");
            self.notify();
        }
        removed
    }

    /// Replace the contents with a fresh scan, emitting at most one
    /// notification for the whole batch
    pub fn resync(&self, scanned: HashMap<PathBuf, UsbDevice>) -> bool {
        let changed = {
            let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
            let before = devices.len();
            devices.retain(|path, _| scanned.contains_key(path));
            let mut changed = devices.len() != before;

            for (path, device) in scanned {
                if devices.get(&path) != Some(&device) {
                    devices.insert(path, device);
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Snapshot of all devices ordered by bus id
    pub fn get_devices(&self) -> Vec<UsbDevice> {
        let mut devices: Vec<UsbDevice> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
        devices
    }

    pub fn get_device(&self, path: &Path) -> Option<UsbDevice> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn get_device_by_bus_id(&self, bus_id: &str) -> Option<UsbDevice> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|d| d.bus_id == bus_id)
            .cloned()
    }

    /// Receiver for coalesced change notifications
    pub fn changes(&self) -> Receiver<()> {
        self.notify_rx.clone()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the notification channel; later mutations no longer notify
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notify_tx.close();
        }
    }

    fn notify(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Full means a notification is already pending
        if self.notify_tx.try_send(()).is_err() {
            trace!("change notification already pending");
        }
    }
}

impl Monitor for DeviceStore {
    fn get_devices(&self) -> Vec<UsbDevice> {
        DeviceStore::get_devices(self)
    }

    fn get_device(&self, path: &Path) -> Option<UsbDevice> {
        DeviceStore::get_device(self, path)
    }

    fn get_device_by_bus_id(&self, bus_id: &str) -> Option<UsbDevice> {
        DeviceStore::get_device_by_bus_id(self, bus_id)
    }

    fn device_changes(&self) -> Receiver<()> {
        self.changes()
    }
}
