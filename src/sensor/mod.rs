//! # Sensor Module
//!
//! IMU sampling over a two-wire (I2C) bus.
//!
//! This module handles:
//! - The immutable [`Sample`] produced on every acquisition tick
//! - Trait seams for the sensor bus and its raw SCL/SDA lines
//! - MPU-6050 access through Linux `i2c-dev`
//! - Sysfs GPIO control of the bus lines for lockup recovery
//! - The bus lockup recovery sequence

pub mod bus_trait;
pub mod gpio;
pub mod mpu6050;
pub mod recovery;
pub mod sample;

pub use bus_trait::{BusLines, SensorBus};
pub use recovery::BusRecoveryController;
pub use sample::{unix_now, Sample};
