//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! The configuration is resolved once at startup; nothing in the daemon
//! re-reads it while running.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{RecorderError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub sampler: SamplerConfig,
    pub bus_recovery: BusRecoveryConfig,
    pub buffer: BufferConfig,
    pub detector: DetectorConfig,
    pub storage: StorageConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

/// IMU sampler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SamplerConfig {
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,

    #[serde(default = "default_address")]
    pub address: u16,

    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,

    #[serde(default = "default_accel_range_g")]
    pub accel_range_g: u8,

    #[serde(default = "default_gyro_range_dps")]
    pub gyro_range_dps: u16,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// I2C bus lockup recovery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BusRecoveryConfig {
    #[serde(default = "default_scl_pin")]
    pub scl_pin: u32,

    #[serde(default = "default_sda_pin")]
    pub sda_pin: u32,

    #[serde(default = "default_clock_pulses")]
    pub clock_pulses: u32,

    #[serde(default = "default_half_cycle_us")]
    pub half_cycle_us: u64,

    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// Sample ring buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: f64,
}

/// Threshold trigger for one event type
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    /// Metric value at or above which the event is active
    pub threshold: f64,

    /// Time the metric must stay below threshold before the event ends
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,

    /// Excursions shorter than this are discarded
    #[serde(default)]
    pub min_duration_ms: u64,
}

/// Event detection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    #[serde(default = "default_pre_event_seconds")]
    pub pre_event_seconds: f64,

    #[serde(default = "default_max_event_samples")]
    pub max_event_samples: usize,

    #[serde(default = "default_rough_road_window_ms")]
    pub rough_road_window_ms: u64,

    #[serde(default = "default_hard_brake")]
    pub hard_brake: TriggerConfig,

    #[serde(default = "default_big_corner")]
    pub big_corner: TriggerConfig,

    #[serde(default = "default_high_g")]
    pub high_g: TriggerConfig,

    #[serde(default = "default_rough_road")]
    pub rough_road: TriggerConfig,
}

/// Durable store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,

    #[serde(default = "default_checkpoint_interval_s")]
    pub checkpoint_interval_s: u64,

    #[serde(default = "default_recovery_grace_ms")]
    pub recovery_grace_ms: u64,

    /// 0 disables the low-rate IMU snapshot collector
    #[serde(default = "default_imu_snapshot_interval_s")]
    pub imu_snapshot_interval_s: u64,

    /// Finished events older than this are pruned; 0 keeps them forever
    #[serde(default = "default_max_event_age_days")]
    pub max_event_age_days: u64,

    /// Size limit for the store; 0 disables it
    #[serde(default = "default_max_db_size_mb")]
    pub max_db_size_mb: u64,
}

/// Supervisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_startup_grace_s")]
    pub startup_grace_s: u64,

    #[serde(default = "default_escalation_window_s")]
    pub escalation_window_s: u64,

    #[serde(default = "default_realert_interval_s")]
    pub realert_interval_s: u64,

    /// "systemd", "device" or "none"
    #[serde(default = "default_keepalive")]
    pub keepalive: String,

    #[serde(default = "default_device_path")]
    pub device_path: String,

    #[serde(default = "default_allow_reboot")]
    pub allow_reboot: bool,

    #[serde(default = "default_acquisition_stale_ms")]
    pub acquisition_stale_ms: u64,

    #[serde(default = "default_acquisition_dead_ms")]
    pub acquisition_dead_ms: u64,

    #[serde(default = "default_acquisition_stale_ms")]
    pub detector_stale_ms: u64,

    #[serde(default = "default_acquisition_dead_ms")]
    pub detector_dead_ms: u64,

    #[serde(default = "default_storage_stale_ms")]
    pub storage_stale_ms: u64,

    #[serde(default = "default_storage_dead_ms")]
    pub storage_dead_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Empty disables the rolling log file
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_i2c_bus() -> u8 { 1 }
fn default_address() -> u16 { 0x68 }
fn default_sample_rate_hz() -> u32 { 100 }
fn default_accel_range_g() -> u8 { 4 }
fn default_gyro_range_dps() -> u16 { 500 }
fn default_read_timeout_ms() -> u64 { 8 }
fn default_failure_threshold() -> u32 { 5 }

fn default_scl_pin() -> u32 { 3 }
fn default_sda_pin() -> u32 { 2 }
fn default_clock_pulses() -> u32 { 9 }
fn default_half_cycle_us() -> u64 { 5 }
fn default_settle_ms() -> u64 { 100 }

fn default_window_seconds() -> f64 { 30.0 }

fn default_dwell_ms() -> u64 { 100 }
fn default_cooldown_seconds() -> f64 { 10.0 }
fn default_pre_event_seconds() -> f64 { 5.0 }
fn default_max_event_samples() -> usize { 3000 }
fn default_rough_road_window_ms() -> u64 { 1000 }
fn default_hard_brake() -> TriggerConfig {
    TriggerConfig { threshold: 0.45, dwell_ms: 100, min_duration_ms: 200 }
}
fn default_big_corner() -> TriggerConfig {
    TriggerConfig { threshold: 0.6, dwell_ms: 100, min_duration_ms: 300 }
}
fn default_high_g() -> TriggerConfig {
    TriggerConfig { threshold: 0.85, dwell_ms: 100, min_duration_ms: 150 }
}
fn default_rough_road() -> TriggerConfig {
    TriggerConfig { threshold: 0.3, dwell_ms: 500, min_duration_ms: 1000 }
}

fn default_db_path() -> String { "./data/telemetry.db".to_string() }
fn default_queue_capacity() -> usize { 1024 }
fn default_sync_batch_size() -> usize { 1000 }
fn default_checkpoint_interval_s() -> u64 { 600 }
fn default_recovery_grace_ms() -> u64 { 2000 }
fn default_imu_snapshot_interval_s() -> u64 { 1 }
fn default_max_event_age_days() -> u64 { 14 }
fn default_max_db_size_mb() -> u64 { 500 }

fn default_tick_ms() -> u64 { 1000 }
fn default_startup_grace_s() -> u64 { 30 }
fn default_escalation_window_s() -> u64 { 300 }
fn default_realert_interval_s() -> u64 { 60 }
fn default_keepalive() -> String { "systemd".to_string() }
fn default_device_path() -> String { "/dev/watchdog".to_string() }
fn default_allow_reboot() -> bool { false }
fn default_acquisition_stale_ms() -> u64 { 1000 }
fn default_acquisition_dead_ms() -> u64 { 5000 }
fn default_storage_stale_ms() -> u64 { 30_000 }
fn default_storage_dead_ms() -> u64 { 120_000 }

fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_log_file_prefix() -> String { "roadrecorder.log".to_string() }

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            i2c_bus: default_i2c_bus(),
            address: default_address(),
            sample_rate_hz: default_sample_rate_hz(),
            accel_range_g: default_accel_range_g(),
            gyro_range_dps: default_gyro_range_dps(),
            read_timeout_ms: default_read_timeout_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl Default for BusRecoveryConfig {
    fn default() -> Self {
        Self {
            scl_pin: default_scl_pin(),
            sda_pin: default_sda_pin(),
            clock_pulses: default_clock_pulses(),
            half_cycle_us: default_half_cycle_us(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { window_seconds: default_window_seconds() }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
            pre_event_seconds: default_pre_event_seconds(),
            max_event_samples: default_max_event_samples(),
            rough_road_window_ms: default_rough_road_window_ms(),
            hard_brake: default_hard_brake(),
            big_corner: default_big_corner(),
            high_g: default_high_g(),
            rough_road: default_rough_road(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            queue_capacity: default_queue_capacity(),
            sync_batch_size: default_sync_batch_size(),
            checkpoint_interval_s: default_checkpoint_interval_s(),
            recovery_grace_ms: default_recovery_grace_ms(),
            imu_snapshot_interval_s: default_imu_snapshot_interval_s(),
            max_event_age_days: default_max_event_age_days(),
            max_db_size_mb: default_max_db_size_mb(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            startup_grace_s: default_startup_grace_s(),
            escalation_window_s: default_escalation_window_s(),
            realert_interval_s: default_realert_interval_s(),
            keepalive: default_keepalive(),
            device_path: default_device_path(),
            allow_reboot: default_allow_reboot(),
            acquisition_stale_ms: default_acquisition_stale_ms(),
            acquisition_dead_ms: default_acquisition_dead_ms(),
            detector_stale_ms: default_acquisition_stale_ms(),
            detector_dead_ms: default_acquisition_dead_ms(),
            storage_stale_ms: default_storage_stale_ms(),
            storage_dead_ms: default_storage_dead_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
            file_prefix: default_log_file_prefix(),
        }
    }
}

impl SamplerConfig {
    /// Time between two scheduled reads
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.sample_rate_hz))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl WatchdogConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_s)
    }

    pub fn escalation_window(&self) -> Duration {
        Duration::from_secs(self.escalation_window_s)
    }

    pub fn realert_interval(&self) -> Duration {
        Duration::from_secs(self.realert_interval_s)
    }
}

fn invalid(msg: impl std::fmt::Display) -> RecorderError {
    RecorderError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use roadrecorder::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Sampler
        if ![50, 100, 200].contains(&self.sampler.sample_rate_hz) {
            return Err(invalid("sample_rate_hz must be one of: 50, 100, 200"));
        }

        if ![2, 4, 8, 16].contains(&self.sampler.accel_range_g) {
            return Err(invalid("accel_range_g must be one of: 2, 4, 8, 16"));
        }

        if ![250, 500, 1000, 2000].contains(&self.sampler.gyro_range_dps) {
            return Err(invalid("gyro_range_dps must be one of: 250, 500, 1000, 2000"));
        }

        if self.sampler.address > 0x7F {
            return Err(invalid("address must be a 7-bit I2C address"));
        }

        // A read must never outlive its tick
        if self.sampler.read_timeout_ms == 0
            || self.sampler.read_timeout() >= self.sampler.tick_period()
        {
            return Err(invalid(format!(
                "read_timeout_ms must be between 1 and one tick period ({:?})",
                self.sampler.tick_period()
            )));
        }

        if self.sampler.failure_threshold == 0 || self.sampler.failure_threshold > 100 {
            return Err(invalid("failure_threshold must be between 1 and 100"));
        }

        // Bus recovery
        if self.bus_recovery.scl_pin == self.bus_recovery.sda_pin {
            return Err(invalid("scl_pin and sda_pin must differ"));
        }

        if self.bus_recovery.clock_pulses == 0 || self.bus_recovery.clock_pulses > 32 {
            return Err(invalid("clock_pulses must be between 1 and 32"));
        }

        if self.bus_recovery.half_cycle_us == 0 || self.bus_recovery.half_cycle_us > 1000 {
            return Err(invalid("half_cycle_us must be between 1 and 1000"));
        }

        if self.bus_recovery.settle_ms > 5000 {
            return Err(invalid("settle_ms must be at most 5000"));
        }

        // Buffer
        if !(1.0..=300.0).contains(&self.buffer.window_seconds) {
            return Err(invalid("window_seconds must be between 1 and 300"));
        }

        // Detector
        if self.detector.cooldown_seconds < 0.0 {
            return Err(invalid("cooldown_seconds must not be negative"));
        }

        if self.detector.pre_event_seconds < 0.0
            || self.detector.pre_event_seconds > self.buffer.window_seconds
        {
            return Err(invalid("pre_event_seconds must be between 0 and window_seconds"));
        }

        if self.detector.max_event_samples == 0 {
            return Err(invalid("max_event_samples must be greater than 0"));
        }

        if self.detector.rough_road_window_ms < 100 {
            return Err(invalid("rough_road_window_ms must be at least 100"));
        }

        for (name, trigger) in [
            ("hard_brake", &self.detector.hard_brake),
            ("big_corner", &self.detector.big_corner),
            ("high_g", &self.detector.high_g),
            ("rough_road", &self.detector.rough_road),
        ] {
            if !trigger.threshold.is_finite() || trigger.threshold <= 0.0 {
                return Err(invalid(format!("{}.threshold must be a positive number", name)));
            }
            if trigger.dwell_ms == 0 || trigger.dwell_ms > 60_000 {
                return Err(invalid(format!("{}.dwell_ms must be between 1 and 60000", name)));
            }
        }

        // Storage
        if self.storage.db_path.is_empty() {
            return Err(invalid("db_path cannot be empty"));
        }

        if self.storage.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }

        if self.storage.sync_batch_size == 0 {
            return Err(invalid("sync_batch_size must be greater than 0"));
        }

        if self.storage.checkpoint_interval_s < 60 {
            return Err(invalid("checkpoint_interval_s must be at least 60"));
        }

        if self.storage.max_event_age_days > 3650 {
            return Err(invalid("max_event_age_days must be at most 3650"));
        }

        // Watchdog
        if self.watchdog.tick_ms == 0 || self.watchdog.tick_ms > 60_000 {
            return Err(invalid("watchdog tick_ms must be between 1 and 60000"));
        }

        if !["systemd", "device", "none"].contains(&self.watchdog.keepalive.as_str()) {
            return Err(invalid("keepalive must be one of: systemd, device, none"));
        }

        if self.watchdog.keepalive == "device" && self.watchdog.device_path.is_empty() {
            return Err(invalid("device_path cannot be empty when keepalive = \"device\""));
        }

        for (name, stale, dead) in [
            ("acquisition", self.watchdog.acquisition_stale_ms, self.watchdog.acquisition_dead_ms),
            ("detector", self.watchdog.detector_stale_ms, self.watchdog.detector_dead_ms),
            ("storage", self.watchdog.storage_stale_ms, self.watchdog.storage_dead_ms),
        ] {
            if stale == 0 || stale >= dead {
                return Err(invalid(format!(
                    "{} stale threshold must be positive and below its dead threshold",
                    name
                )));
            }
        }

        if self.watchdog.realert_interval_s == 0 {
            return Err(invalid("realert_interval_s must be greater than 0"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[sampler]
i2c_bus = 0

[bus_recovery]

[buffer]
window_seconds = 20.0

[detector]
cooldown_seconds = 5.0

[detector.hard_brake]
threshold = 0.5

[storage]
db_path = "/var/lib/roadrecorder/telemetry.db"

[watchdog]
keepalive = "none"

[logging]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.sampler.i2c_bus, 0);
        assert_eq!(config.buffer.window_seconds, 20.0);
        assert_eq!(config.detector.hard_brake.threshold, 0.5);
        assert_eq!(config.detector.hard_brake.dwell_ms, default_dwell_ms());
        assert_eq!(config.detector.hard_brake.min_duration_ms, 0);
        assert_eq!(config.detector.big_corner, default_big_corner());
        assert_eq!(config.watchdog.keepalive, "none");
    }

    #[test]
    fn test_missing_section_is_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[sampler]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_read_timeout_must_fit_in_tick() {
        let mut config = Config::default();
        config.sampler.read_timeout_ms = 10; // 100Hz tick is exactly 10ms
        assert!(config.validate().is_err());

        config.sampler.read_timeout_ms = 9;
        assert!(config.validate().is_ok());

        config.sampler.sample_rate_hz = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_timeout_zero() {
        let mut config = Config::default();
        config.sampler.read_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_sample_rate() {
        let mut config = Config::default();
        config.sampler.sample_rate_hz = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_accel_range() {
        let mut config = Config::default();
        config.sampler.accel_range_g = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_gyro_range() {
        let mut config = Config::default();
        config.sampler.gyro_range_dps = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_out_of_range() {
        let mut config = Config::default();
        config.sampler.address = 0x80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failure_threshold_zero() {
        let mut config = Config::default();
        config.sampler.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_recovery_pins() {
        let mut config = Config::default();
        config.bus_recovery.sda_pin = config.bus_recovery.scl_pin;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clock_pulses_zero() {
        let mut config = Config::default();
        config.bus_recovery.clock_pulses = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_seconds_out_of_range() {
        let mut config = Config::default();
        config.buffer.window_seconds = 0.5;
        assert!(config.validate().is_err());

        config.buffer.window_seconds = 301.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pre_event_longer_than_buffer() {
        let mut config = Config::default();
        config.detector.pre_event_seconds = config.buffer.window_seconds + 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_cooldown() {
        let mut config = Config::default();
        config.detector.cooldown_seconds = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_event_samples_zero() {
        let mut config = Config::default();
        config.detector.max_event_samples = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_threshold_not_positive() {
        let mut config = Config::default();
        config.detector.high_g.threshold = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detector.big_corner.threshold = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_dwell_zero() {
        let mut config = Config::default();
        config.detector.rough_road.dwell_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_db_path() {
        let mut config = Config::default();
        config.storage.db_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_capacity_zero() {
        let mut config = Config::default();
        config.storage.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_interval_too_short() {
        let mut config = Config::default();
        config.storage.checkpoint_interval_s = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retention_limits() {
        let mut config = Config::default();
        config.storage.max_event_age_days = 0;
        config.storage.max_db_size_mb = 0;
        assert!(config.validate().is_ok());

        config.storage.max_event_age_days = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_keepalive() {
        let mut config = Config::default();
        config.watchdog.keepalive = "gpio".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_keepalive_requires_path() {
        let mut config = Config::default();
        config.watchdog.keepalive = "device".to_string();
        config.watchdog.device_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_not_below_dead() {
        let mut config = Config::default();
        config.watchdog.storage_stale_ms = config.watchdog.storage_dead_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_period() {
        let config = SamplerConfig::default();
        assert_eq!(config.tick_period(), Duration::from_millis(10));
        assert_eq!(config.read_timeout(), Duration::from_millis(8));
    }

    #[test]
    fn test_default_functions() {
        assert_eq!(default_i2c_bus(), 1);
        assert_eq!(default_address(), 0x68);
        assert_eq!(default_sample_rate_hz(), 100);
        assert_eq!(default_failure_threshold(), 5);
        assert_eq!(default_clock_pulses(), 9);
        assert_eq!(default_settle_ms(), 100);
        assert_eq!(default_window_seconds(), 30.0);
        assert_eq!(default_cooldown_seconds(), 10.0);
        assert_eq!(default_escalation_window_s(), 300);
        assert_eq!(default_keepalive(), "systemd");
        assert_eq!(default_log_level(), "info");
    }
}
