//! Keepalive sinks.
//!
//! The supervisor pets exactly one of these per tick when the system is
//! healthy. Missing a pet is the failure signal: systemd or the hardware
//! watchdog resets the unit when pets stop arriving.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::WatchdogConfig;
use crate::error::{RecorderError, Result};

/// Something that must be petted regularly to avoid a reset
#[cfg_attr(test, mockall::automock)]
pub trait Keepalive: Send {
    /// Emit one keepalive
    fn pet(&mut self) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// `sd_notify(WATCHDOG=1)` over the service manager's notify socket
#[derive(Debug)]
pub struct SystemdNotify {
    socket: UnixDatagram,
    target: PathBuf,
}

impl SystemdNotify {
    /// Connect to `$NOTIFY_SOCKET`.
    ///
    /// Returns `None` when the variable is unset (not running under a
    /// `Type=notify` unit).
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os("NOTIFY_SOCKET") {
            Some(path) if !path.is_empty() => Self::connect(PathBuf::from(path)).map(Some),
            _ => Ok(None),
        }
    }

    pub fn connect(target: PathBuf) -> Result<Self> {
        let socket = UnixDatagram::unbound()?;
        Ok(Self { socket, target })
    }

    /// Tell the service manager start-up has finished
    pub fn ready(&mut self) -> Result<()> {
        self.send("READY=1")
    }

    /// Tell the service manager a clean stop is in progress
    pub fn stopping(&mut self) -> Result<()> {
        self.send("STOPPING=1")
    }

    fn send(&self, state: &str) -> Result<()> {
        let target = self.target.to_string_lossy();
        if let Some(name) = target.strip_prefix('@') {
            send_abstract(&self.socket, name, state)
        } else {
            self.socket.send_to(state.as_bytes(), &self.target)?;
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, state: &str) -> Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.send_to_addr(state.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, name: &str, _state: &str) -> Result<()> {
    Err(RecorderError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("abstract notify socket @{} needs Linux", name),
    )))
}

impl Keepalive for SystemdNotify {
    fn pet(&mut self) -> Result<()> {
        self.send("WATCHDOG=1")
    }

    fn name(&self) -> &'static str {
        "systemd"
    }
}

/// Linux hardware watchdog character device.
///
/// Once opened the device must be written to within its timeout or the
/// board resets. Dropping writes the magic close character so a clean
/// shutdown disarms it.
#[derive(Debug)]
pub struct WatchdogDevice {
    file: Option<File>,
    path: PathBuf,
}

impl WatchdogDevice {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().write(true).open(&path)?;
        info!(path = %path.display(), "Hardware watchdog armed");
        Ok(Self { file: Some(file), path })
    }
}

impl Keepalive for WatchdogDevice {
    fn pet(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or(RecorderError::ChannelClosed("watchdog device"))?;
        file.write_all(b"\0")?;
        file.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "device"
    }
}

impl Drop for WatchdogDevice {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            match file.write_all(b"V") {
                Ok(()) => info!(path = %self.path.display(), "Hardware watchdog disarmed"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to disarm hardware watchdog"),
            }
        }
    }
}

/// Keepalive that goes nowhere (bench runs, development)
#[derive(Debug, Default)]
pub struct NoKeepalive;

impl Keepalive for NoKeepalive {
    fn pet(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Build the keepalive selected by `watchdog.keepalive`.
///
/// A systemd keepalive without `$NOTIFY_SOCKET` falls back to
/// [`NoKeepalive`] with a warning.
pub fn from_config(config: &WatchdogConfig) -> Result<Box<dyn Keepalive>> {
    match config.keepalive.as_str() {
        "systemd" => match SystemdNotify::from_env()? {
            Some(notify) => {
                debug!(target = %notify.target.display(), "Using systemd keepalive");
                Ok(Box::new(notify))
            }
            None => {
                warn!("NOTIFY_SOCKET not set, keepalive disabled");
                Ok(Box::new(NoKeepalive))
            }
        },
        "device" => Ok(Box::new(WatchdogDevice::open(&config.device_path)?)),
        "none" => Ok(Box::new(NoKeepalive)),
        other => Err(RecorderError::Config(<toml::de::Error as serde::de::Error>::custom(
            format!("unknown keepalive '{}'", other),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_systemd_notify_sends_watchdog_datagram() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let server = UnixDatagram::bind(&path).unwrap();

        let mut notify = SystemdNotify::connect(path).unwrap();
        notify.pet().unwrap();
        notify.ready().unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
    }

    #[test]
    fn test_systemd_notify_missing_socket_fails() {
        let dir = TempDir::new().unwrap();
        let mut notify = SystemdNotify::connect(dir.path().join("absent.sock")).unwrap();
        assert!(notify.pet().is_err());
    }

    #[test]
    fn test_device_writes_pets_and_magic_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchdog");
        std::fs::write(&path, b"").unwrap();

        {
            let mut device = WatchdogDevice::open(&path).unwrap();
            device.pet().unwrap();
            device.pet().unwrap();
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0V");
    }

    #[test]
    fn test_from_config_none_and_unknown() {
        let mut config = WatchdogConfig::default();
        config.keepalive = "none".to_string();
        let mut keepalive = from_config(&config).unwrap();
        assert_eq!(keepalive.name(), "none");
        assert!(keepalive.pet().is_ok());

        config.keepalive = "carrier-pigeon".to_string();
        assert!(from_config(&config).is_err());
    }
}
