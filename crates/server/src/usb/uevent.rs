//! Kernel uevent sources
//!
//! Events come from the `NETLINK_KOBJECT_UEVENT` multicast group. Messages
//! look like `add@/devices/pci0000:00/.../3-2\0ACTION=add\0SUBSYSTEM=usb\0...`.

use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, socket,
};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::str::FromStr;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::trace;

/// Kernel multicast group for uevents
const KERNEL_UEVENT_GROUP: u32 = 1;

/// Largest uevent the kernel emits
const UEVENT_BUFFER_SIZE: usize = 8192;

/// Uevent action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
}

impl Action {
    /// Actions after which the device should be (re)loaded
    pub fn is_presence(self) -> bool {
        matches!(self, Self::Add | Self::Change | Self::Online | Self::Bind)
    }

    /// Actions after which the device should be dropped
    pub fn is_absence(self) -> bool {
        matches!(self, Self::Remove | Self::Offline | Self::Unbind)
    }
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            "move" => Self::Move,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            _ => return Err(()),
        })
    }
}

/// A parsed kernel uevent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UEvent {
    pub action: Action,
    pub devpath: String,
    pub env: HashMap<String, String>,
}

impl UEvent {
    /// Parse a raw netlink message. Messages relayed by udevd (prefixed
    /// `libudev`) and malformed messages yield `None`.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.starts_with(b"libudev") {
            return None;
        }

        let mut fields = raw
            .split(|b| *b == 0)
            .filter(|f| !f.is_empty())
            .filter_map(|f| std::str::from_utf8(f).ok());

        let (action, devpath) = fields.next()?.split_once('@')?;
        let env = fields
            .filter_map(|f| f.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some(Self {
            action: action.parse().ok()?,
            devpath: devpath.to_string(),
            env,
        })
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.env.get("SUBSYSTEM").map(String::as_str)
    }

    pub fn devtype(&self) -> Option<&str> {
        self.env.get("DEVTYPE").map(String::as_str)
    }

    /// True for whole USB devices; interfaces and other subsystems are ignored
    pub fn is_usb_device(&self) -> bool {
        self.subsystem() == Some("usb") && self.devtype() == Some("usb_device")
    }

    /// Last component of the devpath, e.g. `3-2.1`
    pub fn bus_id(&self) -> Option<&str> {
        self.devpath
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}

/// A stream of uevents
///
/// `Ok(None)` means the source is exhausted.
pub trait UeventSource: Send {
    fn next_event(&mut self) -> impl Future<Output = io::Result<Option<UEvent>>> + Send;
}

/// Uevents read from the kernel netlink socket
pub struct NetlinkUeventSource {
    fd: AsyncFd<OwnedFd>,
    buffer: Vec<u8>,
}

impl NetlinkUeventSource {
    /// Open and bind the netlink socket; requires a tokio runtime
    pub fn open() -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        bind(
            fd.as_raw_fd(),
            &NetlinkAddr::new(0, KERNEL_UEVENT_GROUP),
        )?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            buffer: vec![0; UEVENT_BUFFER_SIZE],
        })
    }
}

impl UeventSource for NetlinkUeventSource {
    async fn next_event(&mut self) -> io::Result<Option<UEvent>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buffer = &mut self.buffer;
            let received = guard.try_io(|fd| {
                recv(fd.get_ref().as_raw_fd(), buffer, MsgFlags::empty()).map_err(io::Error::from)
            });

            match received {
                Ok(Ok(len)) => match UEvent::parse(&self.buffer[..len]) {
                    Some(event) => return Ok(Some(event)),
                    None => trace!(len, "ignoring uevent message"),
                },
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ENOBUFS: the kernel dropped events; resync will catch up
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::ENOBUFS) => {
                    trace!("uevent socket overrun");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Uevents injected through a channel, for tests and replay
pub struct ChannelUeventSource {
    rx: mpsc::Receiver<UEvent>,
}

impl ChannelUeventSource {
    /// Create a source and the sender that feeds it
    pub fn channel(capacity: usize) -> (mpsc::Sender<UEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

impl UeventSource for ChannelUeventSource {
    async fn next_event(&mut self) -> io::Result<Option<UEvent>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(part.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn test_parse_usb_device_event() {
        let event = UEvent::parse(&raw(&[
            "add@/devices/pci0000:00/0000:00:14.0/usb3/3-2",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:00:14.0/usb3/3-2",
            "SUBSYSTEM=usb",
            "DEVTYPE=usb_device",
            "SEQNUM=4711",
        ]))
        .unwrap();

        assert_eq!(event.action, Action::Add);
        assert!(event.is_usb_device());
        assert_eq!(event.bus_id(), Some("3-2"));
        assert_eq!(event.env.get("SEQNUM").map(String::as_str), Some("4711"));
    }

    #[test]
    fn test_interface_event_is_not_a_device() {
        let event = UEvent::parse(&raw(&[
            "bind@/devices/pci0000:00/0000:00:14.0/usb3/3-2/3-2:1.0",
            "SUBSYSTEM=usb",
            "DEVTYPE=usb_interface",
        ]))
        .unwrap();
        assert!(!event.is_usb_device());
    }

    #[test]
    fn test_rejects_libudev_and_garbage() {
        assert!(UEvent::parse(b"libudev\0\xfe\xed").is_none());
        assert!(UEvent::parse(&raw(&["no separator"])).is_none());
        assert!(UEvent::parse(&raw(&["explode@/devices/x"])).is_none());
        assert!(UEvent::parse(b"").is_none());
    }

    #[test]
    fn test_action_classes() {
        assert!(Action::Bind.is_presence());
        assert!(Action::Unbind.is_absence());
        assert!(!Action::Move.is_presence());
        assert!(!Action::Move.is_absence());
    }

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut source) = ChannelUeventSource::channel(4);
        let event = UEvent::parse(&raw(&["remove@/devices/usb1/1-1", "SUBSYSTEM=usb"])).unwrap();
        tx.send(event.clone()).await.unwrap();
        drop(tx);

        assert_eq!(source.next_event().await.unwrap(), Some(event));
        assert_eq!(source.next_event().await.unwrap(), None);
    }
}
