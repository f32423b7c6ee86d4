//! Trait abstraction for sensor bus operations to enable testing

use std::time::Duration;

use super::Sample;
use crate::error::Result;

/// Blocking access to the IMU behind the two-wire bus.
///
/// Owned exclusively by the acquisition loop; lent to the recovery
/// controller by `&mut` borrow while a lockup is being cleared.
pub trait SensorBus: Send {
    /// Read one sample, giving up after `timeout`
    fn read_sample(&mut self, timeout: Duration) -> Result<Sample>;

    /// Close the bus handle so the lines can be driven directly
    fn release(&mut self) -> Result<()>;

    /// Reopen the bus handle after recovery
    fn reopen(&mut self) -> Result<()>;

    /// Write the sensor's operating registers
    fn initialize(&mut self) -> Result<()>;
}

/// Pin-level control over the bus clock (SCL) and data (SDA) lines.
///
/// Only these two lines are ever touched.
pub trait BusLines: Send {
    /// Take SCL as an output, driven high
    fn claim(&mut self) -> Result<()>;

    /// Drive SCL
    fn set_scl(&mut self, high: bool) -> Result<()>;

    /// Drive SDA, taking it as an output on first use
    fn set_sda(&mut self, high: bool) -> Result<()>;

    /// Hand both lines back to the bus driver
    fn release(&mut self) -> Result<()>;
}
