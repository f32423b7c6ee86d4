//! IMU sample type

use serde::{Deserialize, Serialize};

/// One timestamped six-axis IMU reading.
///
/// Produced once per acquisition tick and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix seconds
    pub timestamp: f64,
    /// Acceleration X (g), positive forward
    pub ax: f64,
    /// Acceleration Y (g), positive left
    pub ay: f64,
    /// Acceleration Z (g)
    pub az: f64,
    /// Gyro X (deg/s)
    pub gx: f64,
    /// Gyro Y (deg/s)
    pub gy: f64,
    /// Gyro Z (deg/s)
    pub gz: f64,
}

impl Sample {
    /// Sample with only acceleration populated.
    pub fn accel(timestamp: f64, ax: f64, ay: f64, az: f64) -> Self {
        Self {
            timestamp,
            ax,
            ay,
            az,
            gx: 0.0,
            gy: 0.0,
            gz: 0.0,
        }
    }

    /// Total acceleration magnitude in g.
    pub fn accel_magnitude(&self) -> f64 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }
}

/// Wall clock as Unix seconds, the time base of every sample
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accel_constructor_zeroes_gyro() {
        let s = Sample::accel(1.0, 0.1, 0.2, 1.0);
        assert_eq!(s.gx, 0.0);
        assert_eq!(s.gy, 0.0);
        assert_eq!(s.gz, 0.0);
    }

    #[test]
    fn test_accel_magnitude() {
        let s = Sample::accel(0.0, 0.0, 0.0, 1.0);
        assert!((s.accel_magnitude() - 1.0).abs() < 1e-12);

        let s = Sample::accel(0.0, 3.0, 4.0, 0.0);
        assert!((s.accel_magnitude() - 5.0).abs() < 1e-12);
    }
}
