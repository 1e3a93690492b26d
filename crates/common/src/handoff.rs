//! Socket ownership transfer to the kernel
//!
//! Once a socket descriptor has been written to a USB/IP control attribute
//! the kernel owns it. [`DetachedFd`] holds a duplicate of a socket until
//! that point; after a successful handoff the descriptor is released without
//! being closed.

use std::io;
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd, RawFd};

/// Duplicated descriptor that will be given to the kernel
#[derive(Debug)]
pub struct DetachedFd(OwnedFd);

impl DetachedFd {
    /// Duplicate `source`; the copy is independent of the original's lifetime
    pub fn duplicate<F: AsFd>(source: &F) -> io::Result<Self> {
        Ok(Self(source.as_fd().try_clone_to_owned()?))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    /// Pass the descriptor number to `handoff`
    ///
    /// If `handoff` succeeds the descriptor is leaked on purpose and belongs
    /// to the kernel from then on. On failure it is closed as usual.
    pub fn hand_over<T, E>(self, handoff: impl FnOnce(RawFd) -> Result<T, E>) -> Result<T, E> {
        let value = handoff(self.as_raw_fd())?;
        let _kernel_owned = self.0.into_raw_fd();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn is_open(fd: RawFd) -> bool {
        std::path::Path::new(&format!("/proc/self/fd/{fd}")).exists()
    }

    #[test]
    fn test_duplicate_outlives_source() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let detached = DetachedFd::duplicate(&stream).unwrap();
        assert_ne!(detached.as_raw_fd(), stream.as_raw_fd());
        drop(stream);
        assert!(is_open(detached.as_raw_fd()));
    }

    #[test]
    fn test_successful_handoff_keeps_fd_open() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let detached = DetachedFd::duplicate(&stream).unwrap();
        let fd = detached
            .hand_over(|fd| Ok::<_, io::Error>(fd))
            .unwrap();
        assert!(is_open(fd));

        // SAFETY: the test owns this descriptor again and closes it
        drop(unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) });
    }

    #[test]
    fn test_failed_handoff_leaves_source_usable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let detached = DetachedFd::duplicate(&stream).unwrap();
        let result: Result<(), &str> = detached.hand_over(|_| Err("attach rejected"));
        assert_eq!(result, Err("attach rejected"));
        assert!(stream.peer_addr().is_ok());
    }
}
