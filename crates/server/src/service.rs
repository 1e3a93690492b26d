//! Systemd service integration
//!
//! Minimal sd-notify client: readiness, stopping, status text, and watchdog
//! keepalives are sent as datagrams to `$NOTIFY_SOCKET`. Every call is a
//! no-op when the daemon is not started by systemd with `Type=notify`.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";
const WATCHDOG_USEC: &str = "WATCHDOG_USEC";

/// Send one sd-notify message to `socket_path`
fn send_to(socket_path: &Path, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {message:?} to systemd"))?;
    Ok(())
}

/// Send `message` if running under systemd; returns whether it was sent
fn notify(message: &str) -> Result<bool> {
    match env::var_os(NOTIFY_SOCKET) {
        Some(path) => {
            send_to(Path::new(&path), message)?;
            Ok(true)
        }
        None => {
            debug!("NOTIFY_SOCKET not set, skipping systemd notification");
            Ok(false)
        }
    }
}

/// `READY=1`, once the daemon accepts connections
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    }
    Ok(())
}

/// `STOPPING=1`, at the start of shutdown
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={status}"))?;
    Ok(())
}

pub fn is_systemd() -> bool {
    env::var_os(NOTIFY_SOCKET).is_some()
}

fn parse_watchdog_usec(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|usec| *usec > 0)
        .map(Duration::from_micros)
}

/// Watchdog timeout configured by systemd, if any
pub fn watchdog_timeout() -> Option<Duration> {
    parse_watchdog_usec(env::var(WATCHDOG_USEC).ok().as_deref())
}

/// Send `WATCHDOG=1` at half the configured timeout until `shutdown` fires
///
/// Returns `None` when the watchdog is not enabled.
pub fn spawn_watchdog(shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let timeout = watchdog_timeout()?;
    let period = (timeout / 2).max(Duration::from_secs(1));
    info!("Systemd watchdog enabled, interval: {:?}", period);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = notify("WATCHDOG=1") {
                        error!("Failed to send watchdog keepalive: {:#}", e);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_send_to_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&path).unwrap();

        send_to(&path, "READY=1").unwrap();

        let mut buf = [0u8; 64];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"READY=1");
    }

    #[test]
    fn test_send_to_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        assert!(send_to(&dir.path().join("absent.sock"), "READY=1").is_err());
    }

    #[test]
    fn test_parse_watchdog_usec() {
        assert_eq!(
            parse_watchdog_usec(Some("30000000")),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parse_watchdog_usec(Some("0")), None);
        assert_eq!(parse_watchdog_usec(Some("invalid")), None);
        assert_eq!(parse_watchdog_usec(None), None);
    }
}
