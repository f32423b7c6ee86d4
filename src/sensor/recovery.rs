//! # Bus Lockup Recovery
//!
//! Clears a two-wire bus wedged by a slave holding SDA low.
//!
//! ## Sequence
//!
//! 1. Close the bus handle
//! 2. Take SCL as a GPIO output and clock it a fixed number of times so the
//!    slave can finish whatever byte it thinks it is sending
//! 3. Generate a STOP condition (SDA rises while SCL is high)
//! 4. Hand SCL and SDA back to the bus driver (no other pin is touched)
//! 5. Wait for the driver to reclaim the pins
//! 6. Reopen the bus and rewrite the sensor's operating registers
//!
//! A reopened handle says nothing about the sensor's internal state, so
//! step 6 always reinitialises.

use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{BusLines, SensorBus};
use crate::config::BusRecoveryConfig;
use crate::error::Result;

/// Runs the bus unstick sequence.
///
/// Never returns an error: every failure inside the sequence is logged and
/// reported as `false`. Failure has no retry tier; the caller escalates.
pub struct BusRecoveryController<L: BusLines> {
    lines: L,
    clock_pulses: u32,
    half_cycle: Duration,
    settle: Duration,
    attempts: u64,
    successes: u64,
}

impl<L: BusLines> BusRecoveryController<L> {
    pub fn new(lines: L, config: &BusRecoveryConfig) -> Self {
        Self {
            lines,
            clock_pulses: config.clock_pulses,
            half_cycle: Duration::from_micros(config.half_cycle_us),
            settle: Duration::from_millis(config.settle_ms),
            attempts: 0,
            successes: 0,
        }
    }

    /// Attempt to recover `bus`.
    ///
    /// The bus is borrowed exclusively for the whole sequence.
    pub fn recover<B: SensorBus + ?Sized>(&mut self, bus: &mut B) -> bool {
        self.attempts += 1;
        info!(attempt = self.attempts, "Starting I2C bus recovery");

        // A wedged handle may refuse to close cleanly; carry on regardless
        if let Err(e) = bus.release() {
            warn!(error = %e, "Failed to release bus handle before recovery");
        }

        if let Err(e) = self.clock_out() {
            error!(error = %e, "I2C bit-bang sequence failed");
            if let Err(e) = self.lines.release() {
                warn!(error = %e, "Failed to hand bus lines back to driver");
            }
            return false;
        }

        thread::sleep(self.settle);

        if let Err(e) = bus.reopen() {
            error!(error = %e, "Failed to reopen I2C bus after recovery");
            return false;
        }

        if let Err(e) = bus.initialize() {
            error!(error = %e, "Failed to reinitialise sensor after recovery");
            return false;
        }

        self.successes += 1;
        info!(attempt = self.attempts, "I2C bus recovery successful");
        true
    }

    /// Number of recovery attempts so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Number of successful recoveries so far
    pub fn successes(&self) -> u64 {
        self.successes
    }

    fn clock_out(&mut self) -> Result<()> {
        self.lines.claim()?;

        for _ in 0..self.clock_pulses {
            self.lines.set_scl(false)?;
            thread::sleep(self.half_cycle);
            self.lines.set_scl(true)?;
            thread::sleep(self.half_cycle);
        }

        // STOP: SDA low -> high while SCL is held high
        self.lines.set_sda(false)?;
        thread::sleep(self.half_cycle);
        self.lines.set_sda(true)?;

        self.lines.release()
    }
}
