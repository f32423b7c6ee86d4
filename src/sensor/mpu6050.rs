//! # MPU-6050 over Linux i2c-dev
//!
//! Reads the accelerometer and gyroscope as one 14-byte burst starting at
//! `ACCEL_XOUT_H`.
//!
//! ## Register Setup
//!
//! | Register     | Value                      | Meaning                     |
//! |--------------|----------------------------|-----------------------------|
//! | PWR_MGMT_1   | 0x00                       | Wake, internal oscillator   |
//! | SMPLRT_DIV   | 1000 / rate - 1            | Output rate (DLPF on, 1kHz) |
//! | CONFIG       | 0x03                       | DLPF ~44 Hz                 |
//! | ACCEL_CONFIG | range bits                 | ±2/4/8/16 g                 |
//! | GYRO_CONFIG  | range bits                 | ±250/500/1000/2000 deg/s    |
//!
//! ## Read Timeout
//!
//! The register address write and the burst read go out as one `I2C_RDWR`
//! combined transaction, so the adapter timeout applies once per sample.
//! The kernel counts that timeout in 10ms units, which is coarser than a
//! tick, so a read that completes after the configured timeout is still
//! reported as a failure.

use nix::{ioctl_write_int_bad, ioctl_write_ptr_bad};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{unix_now, Sample, SensorBus};
use crate::config::SamplerConfig;
use crate::error::{RecorderError, Result};

const PWR_MGMT_1: u8 = 0x6B;
const SMPLRT_DIV: u8 = 0x19;
const CONFIG: u8 = 0x1A;
const GYRO_CONFIG: u8 = 0x1B;
const ACCEL_CONFIG: u8 = 0x1C;
const ACCEL_XOUT_H: u8 = 0x3B;

/// Bytes in one accel + temp + gyro burst
const BURST_LEN: usize = 14;

/// i2c-dev ioctl request numbers (linux/i2c-dev.h)
const I2C_TIMEOUT: u16 = 0x0702;
const I2C_SLAVE: u16 = 0x0703;
const I2C_RDWR: u16 = 0x0707;

/// `i2c_msg.flags`: read from the slave
const I2C_M_RD: u16 = 0x0001;

/// `struct i2c_msg` (linux/i2c.h)
#[repr(C)]
#[derive(Debug)]
pub struct I2cMsg {
    pub addr: u16,
    pub flags: u16,
    pub len: u16,
    pub buf: *mut u8,
}

/// `struct i2c_rdwr_ioctl_data` (linux/i2c-dev.h)
#[repr(C)]
#[derive(Debug)]
pub struct I2cRdwrData {
    pub msgs: *mut I2cMsg,
    pub nmsgs: u32,
}

ioctl_write_int_bad!(i2c_set_timeout, I2C_TIMEOUT);
ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);
ioctl_write_ptr_bad!(i2c_rdwr, I2C_RDWR, I2cRdwrData);

/// Accelerometer sensitivity in LSB/g for a full-scale range.
pub fn accel_scale(range_g: u8) -> Option<f64> {
    match range_g {
        2 => Some(16384.0),
        4 => Some(8192.0),
        8 => Some(4096.0),
        16 => Some(2048.0),
        _ => None,
    }
}

/// Gyroscope sensitivity in LSB/(deg/s) for a full-scale range.
pub fn gyro_scale(range_dps: u16) -> Option<f64> {
    match range_dps {
        250 => Some(131.0),
        500 => Some(65.5),
        1000 => Some(32.8),
        2000 => Some(16.4),
        _ => None,
    }
}

fn accel_config_bits(range_g: u8) -> u8 {
    match range_g {
        2 => 0x00,
        4 => 0x08,
        8 => 0x10,
        _ => 0x18,
    }
}

fn gyro_config_bits(range_dps: u16) -> u8 {
    match range_dps {
        250 => 0x00,
        500 => 0x08,
        1000 => 0x10,
        _ => 0x18,
    }
}

/// SMPLRT_DIV value for a target output rate (1kHz base with DLPF enabled)
pub fn sample_rate_divider(rate_hz: u32) -> u8 {
    let divider = (1000 / rate_hz.clamp(4, 1000)).saturating_sub(1);
    divider.min(255) as u8
}

/// i2c-dev timeouts are expressed in units of 10ms; never zero.
pub fn timeout_units(timeout: Duration) -> i32 {
    let units = (timeout.as_millis() + 9) / 10;
    units.clamp(1, i32::MAX as u128) as i32
}

/// Fail a read that finished after its timeout
pub fn check_deadline(elapsed: Duration, timeout: Duration) -> Result<()> {
    if elapsed > timeout {
        return Err(RecorderError::Bus(format!(
            "Sample read took {:?}, timeout is {:?}",
            elapsed, timeout
        )));
    }
    Ok(())
}

/// Write `register`, then read `data.len()` bytes, as one transaction
/// with a repeated start between the two messages.
pub fn burst_messages(address: u16, register: &mut [u8; 1], data: &mut [u8]) -> [I2cMsg; 2] {
    [
        I2cMsg {
            addr: address,
            flags: 0,
            len: 1,
            buf: register.as_mut_ptr(),
        },
        I2cMsg {
            addr: address,
            flags: I2C_M_RD,
            len: data.len() as u16,
            buf: data.as_mut_ptr(),
        },
    ]
}

/// Convert a raw big-endian burst into physical units.
pub fn parse_burst(data: &[u8; BURST_LEN], accel_scale: f64, gyro_scale: f64, timestamp: f64) -> Sample {
    let word = |i: usize| f64::from(i16::from_be_bytes([data[i], data[i + 1]]));

    // Bytes 6-7 hold die temperature, unused here
    Sample {
        timestamp,
        ax: word(0) / accel_scale,
        ay: word(2) / accel_scale,
        az: word(4) / accel_scale,
        gx: word(8) / gyro_scale,
        gy: word(10) / gyro_scale,
        gz: word(12) / gyro_scale,
    }
}

/// MPU-6050 IMU on a Linux I2C adapter
pub struct Mpu6050 {
    device_path: String,
    address: u16,
    sample_rate_hz: u32,
    accel_range_g: u8,
    gyro_range_dps: u16,
    accel_scale: f64,
    gyro_scale: f64,
    file: Option<File>,
    /// Timeout last applied to the open handle, in 10ms units
    applied_timeout: Option<i32>,
}

impl std::fmt::Debug for Mpu6050 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpu6050")
            .field("device_path", &self.device_path)
            .field("address", &format_args!("0x{:02x}", self.address))
            .field("open", &self.file.is_some())
            .finish_non_exhaustive()
    }
}

impl Mpu6050 {
    /// Open `/dev/i2c-N` and configure the sensor
    ///
    /// # Errors
    ///
    /// Returns error if the adapter cannot be opened, the slave address
    /// cannot be selected or the register setup fails
    pub fn open(config: &SamplerConfig) -> Result<Self> {
        let accel = accel_scale(config.accel_range_g).ok_or_else(|| {
            RecorderError::Bus(format!("Unsupported accel range: {}g", config.accel_range_g))
        })?;
        let gyro = gyro_scale(config.gyro_range_dps).ok_or_else(|| {
            RecorderError::Bus(format!("Unsupported gyro range: {}dps", config.gyro_range_dps))
        })?;

        let mut sensor = Self {
            device_path: format!("/dev/i2c-{}", config.i2c_bus),
            address: config.address,
            sample_rate_hz: config.sample_rate_hz,
            accel_range_g: config.accel_range_g,
            gyro_range_dps: config.gyro_range_dps,
            accel_scale: accel,
            gyro_scale: gyro,
            file: None,
            applied_timeout: None,
        };

        sensor.reopen()?;
        sensor.initialize()?;
        Ok(sensor)
    }

    /// Get the adapter device path (e.g., "/dev/i2c-1")
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn handle(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| RecorderError::Bus("I2C handle is closed".to_string()))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<()> {
        let file = self.handle()?;
        file.write_all(&[register, value])
            .map_err(|e| RecorderError::Bus(format!("Failed to write register 0x{:02X}: {}", register, e)))
    }

    fn apply_timeout(&mut self, timeout: Duration) -> Result<()> {
        let units = timeout_units(timeout);
        if self.applied_timeout == Some(units) {
            return Ok(());
        }

        let fd = self.handle()?.as_raw_fd();
        // SAFETY: fd is an open i2c-dev handle owned by self.file
        unsafe { i2c_set_timeout(fd, units) }
            .map_err(|e| RecorderError::Bus(format!("Failed to set I2C timeout: {}", e)))?;
        self.applied_timeout = Some(units);
        Ok(())
    }
}

impl SensorBus for Mpu6050 {
    fn read_sample(&mut self, timeout: Duration) -> Result<Sample> {
        let started = Instant::now();
        self.apply_timeout(timeout)?;
        let fd = self.handle()?.as_raw_fd();

        let mut register = [ACCEL_XOUT_H];
        let mut data = [0u8; BURST_LEN];
        let mut msgs = burst_messages(self.address, &mut register, &mut data);
        let request = I2cRdwrData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };

        // SAFETY: fd is an open i2c-dev handle owned by self.file; every
        // buffer in `msgs` outlives the call and matches its `len`
        unsafe { i2c_rdwr(fd, &request) }
            .map_err(|e| RecorderError::Bus(format!("Failed to read sample burst: {}", e)))?;

        check_deadline(started.elapsed(), timeout)?;
        Ok(parse_burst(&data, self.accel_scale, self.gyro_scale, unix_now()))
    }

    fn release(&mut self) -> Result<()> {
        // Dropping the handle closes the descriptor
        if self.file.take().is_some() {
            debug!("Closed {}", self.device_path);
        }
        self.applied_timeout = None;
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_path)
            .map_err(|e| RecorderError::Bus(format!("Failed to open {}: {}", self.device_path, e)))?;

        // SAFETY: fd comes from the file opened just above
        unsafe { i2c_set_slave(file.as_raw_fd(), i32::from(self.address)) }
            .map_err(|e| RecorderError::Bus(format!("Failed to select slave 0x{:02x}: {}", self.address, e)))?;

        self.file = Some(file);
        self.applied_timeout = None;
        debug!("Opened {} (slave 0x{:02x})", self.device_path, self.address);
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        self.write_register(PWR_MGMT_1, 0x00)?;
        thread::sleep(Duration::from_millis(100));

        self.write_register(SMPLRT_DIV, sample_rate_divider(self.sample_rate_hz))?;
        self.write_register(CONFIG, 0x03)?;
        self.write_register(ACCEL_CONFIG, accel_config_bits(self.accel_range_g))?;
        self.write_register(GYRO_CONFIG, gyro_config_bits(self.gyro_range_dps))?;

        info!(
            sample_rate_hz = self.sample_rate_hz,
            accel_range_g = self.accel_range_g,
            gyro_range_dps = self.gyro_range_dps,
            "MPU-6050 initialised"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scales() {
        assert_eq!(accel_scale(4), Some(8192.0));
        assert_eq!(accel_scale(3), None);
        assert_eq!(gyro_scale(500), Some(65.5));
        assert_eq!(gyro_scale(300), None);
    }

    #[test]
    fn test_config_bits() {
        assert_eq!(accel_config_bits(2), 0x00);
        assert_eq!(accel_config_bits(16), 0x18);
        assert_eq!(gyro_config_bits(500), 0x08);
        assert_eq!(gyro_config_bits(2000), 0x18);
    }

    #[test]
    fn test_sample_rate_divider() {
        assert_eq!(sample_rate_divider(100), 9);
        assert_eq!(sample_rate_divider(200), 4);
        assert_eq!(sample_rate_divider(1000), 0);
    }

    #[test]
    fn test_kernel_timeout_units() {
        assert_eq!(timeout_units(Duration::from_millis(8)), 1);
        assert_eq!(timeout_units(Duration::from_millis(10)), 1);
        assert_eq!(timeout_units(Duration::from_millis(11)), 2);
        assert_eq!(timeout_units(Duration::ZERO), 1);
    }

    #[test]
    fn test_late_read_fails_even_within_kernel_timeout() {
        // 200Hz: the kernel waits up to 10ms but the tick is only 5ms
        let timeout = Duration::from_millis(4);
        assert!(check_deadline(Duration::from_millis(3), timeout).is_ok());
        assert!(check_deadline(timeout, timeout).is_ok());
        match check_deadline(Duration::from_millis(9), timeout) {
            Err(RecorderError::Bus(msg)) => assert!(msg.contains("timeout")),
            other => panic!("Expected Bus error, got: {:?}", other),
        }
    }

    #[test]
    fn test_burst_is_one_combined_transaction() {
        let mut register = [ACCEL_XOUT_H];
        let mut data = [0u8; BURST_LEN];
        let register_ptr = register.as_mut_ptr();
        let data_ptr = data.as_mut_ptr();

        let msgs = burst_messages(0x68, &mut register, &mut data);
        assert_eq!(msgs[0].addr, 0x68);
        assert_eq!(msgs[0].flags, 0);
        assert_eq!(msgs[0].len, 1);
        assert_eq!(msgs[0].buf, register_ptr);
        assert_eq!(msgs[1].addr, 0x68);
        assert_eq!(msgs[1].flags, I2C_M_RD);
        assert_eq!(msgs[1].len, BURST_LEN as u16);
        assert_eq!(msgs[1].buf, data_ptr);
    }

    #[test]
    fn test_parse_burst() {
        // ax = +1g, ay = -0.5g, az = +1g at ±4g; gx = +10 deg/s at ±500
        let mut data = [0u8; BURST_LEN];
        data[0..2].copy_from_slice(&8192i16.to_be_bytes());
        data[2..4].copy_from_slice(&(-4096i16).to_be_bytes());
        data[4..6].copy_from_slice(&8192i16.to_be_bytes());
        data[6..8].copy_from_slice(&1234i16.to_be_bytes()); // temperature
        data[8..10].copy_from_slice(&655i16.to_be_bytes());

        let s = parse_burst(&data, 8192.0, 65.5, 42.0);
        assert_eq!(s.timestamp, 42.0);
        assert!((s.ax - 1.0).abs() < 1e-9);
        assert!((s.ay + 0.5).abs() < 1e-9);
        assert!((s.az - 1.0).abs() < 1e-9);
        assert!((s.gx - 10.0).abs() < 1e-9);
        assert_eq!(s.gy, 0.0);
        assert_eq!(s.gz, 0.0);
    }

    #[test]
    fn test_open_missing_adapter_returns_error() {
        let config = SamplerConfig {
            i2c_bus: 250,
            ..SamplerConfig::default()
        };
        match Mpu6050::open(&config) {
            Err(RecorderError::Bus(msg)) => assert!(msg.contains("/dev/i2c-250")),
            other => panic!("Expected Bus error, got: {:?}", other),
        }
    }

    // Integration test - only runs with an MPU-6050 attached
    #[test]
    #[ignore] // Run with: cargo test -- --ignored
    fn test_read_with_real_hardware() {
        let mut sensor = Mpu6050::open(&SamplerConfig::default()).unwrap();
        let sample = sensor.read_sample(Duration::from_millis(8)).unwrap();
        // Sensor at rest sees roughly 1g in total
        assert!((sample.accel_magnitude() - 1.0).abs() < 0.3);
    }
}
