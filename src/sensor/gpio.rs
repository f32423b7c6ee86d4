//! Sysfs GPIO control of the I2C lines for lockup recovery.
//!
//! Only the configured SCL and SDA pins are exported, driven and handed
//! back; no global GPIO cleanup is ever performed.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::BusLines;
use crate::config::BusRecoveryConfig;
use crate::error::{RecorderError, Result};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Polls while udev applies permissions to a freshly exported pin
const EXPORT_POLL: Duration = Duration::from_millis(5);
const EXPORT_POLL_ATTEMPTS: u32 = 20;

/// SCL/SDA lines driven through `/sys/class/gpio`
#[derive(Debug)]
pub struct SysfsBusLines {
    root: PathBuf,
    scl: u32,
    sda: u32,
    sda_claimed: bool,
    /// Pins this instance exported and must unexport on release
    exported: Vec<u32>,
    /// Pins currently configured as outputs
    driven: Vec<u32>,
}

impl SysfsBusLines {
    pub fn new(config: &BusRecoveryConfig) -> Self {
        Self::with_root(SYSFS_GPIO_ROOT, config)
    }

    /// Use an alternative sysfs root (tests)
    pub fn with_root<P: AsRef<Path>>(root: P, config: &BusRecoveryConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            scl: config.scl_pin,
            sda: config.sda_pin,
            sda_claimed: false,
            exported: Vec::new(),
            driven: Vec::new(),
        }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write(&self, path: PathBuf, value: &str) -> Result<()> {
        fs::write(&path, value)
            .map_err(|e| RecorderError::Gpio(format!("Failed to write {:?} to {}: {}", value, path.display(), e)))
    }

    fn export(&mut self, pin: u32) -> Result<()> {
        if self.pin_dir(pin).exists() {
            return Ok(());
        }

        self.write(self.root.join("export"), &pin.to_string())?;
        self.exported.push(pin);

        for _ in 0..EXPORT_POLL_ATTEMPTS {
            if self.pin_dir(pin).join("direction").exists() {
                return Ok(());
            }
            thread::sleep(EXPORT_POLL);
        }

        Err(RecorderError::Gpio(format!("GPIO{} did not appear after export", pin)))
    }

    /// Configure `pin` as an output with an initial level
    fn drive(&mut self, pin: u32, high: bool) -> Result<()> {
        self.export(pin)?;
        let direction = if high { "high" } else { "low" };
        self.write(self.pin_dir(pin).join("direction"), direction)?;
        if !self.driven.contains(&pin) {
            self.driven.push(pin);
        }
        Ok(())
    }

    fn set(&self, pin: u32, high: bool) -> Result<()> {
        self.write(self.pin_dir(pin).join("value"), if high { "1" } else { "0" })
    }
}

impl BusLines for SysfsBusLines {
    fn claim(&mut self) -> Result<()> {
        debug!(scl = self.scl, "Claiming SCL as GPIO output");
        self.drive(self.scl, true)
    }

    fn set_scl(&mut self, high: bool) -> Result<()> {
        self.set(self.scl, high)
    }

    fn set_sda(&mut self, high: bool) -> Result<()> {
        if self.sda_claimed {
            return self.set(self.sda, high);
        }
        self.drive(self.sda, high)?;
        self.sda_claimed = true;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        let mut first_error = None;

        for pin in std::mem::take(&mut self.driven) {
            if let Err(e) = self.write(self.pin_dir(pin).join("direction"), "in") {
                first_error.get_or_insert(e);
            }
        }

        for pin in std::mem::take(&mut self.exported) {
            if let Err(e) = self.write(self.root.join("unexport"), &pin.to_string()) {
                first_error.get_or_insert(e);
            }
        }

        self.sda_claimed = false;
        debug!(scl = self.scl, sda = self.sda, "Released bus lines");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
