//! Derived metrics, one per event type.
//!
//! The same value drives both detection and peak logging.

use std::collections::VecDeque;

use super::types::EventType;
use crate::sensor::Sample;

/// Longitudinal deceleration (positive when braking)
#[inline]
pub fn hard_brake(sample: &Sample) -> f64 {
    -sample.ax
}

/// Lateral acceleration magnitude
#[inline]
pub fn big_corner(sample: &Sample) -> f64 {
    sample.ay.abs()
}

/// Horizontal acceleration magnitude
#[inline]
pub fn high_g(sample: &Sample) -> f64 {
    sample.ax.hypot(sample.ay)
}

/// Metric for the stateless types; `None` for `RoughRoad`
pub fn instantaneous(event_type: EventType, sample: &Sample) -> Option<f64> {
    match event_type {
        EventType::HardBrake => Some(hard_brake(sample)),
        EventType::BigCorner => Some(big_corner(sample)),
        EventType::HighG => Some(high_g(sample)),
        EventType::RoughRoad => None,
    }
}

/// Population standard deviation over the last `size` values.
///
/// Each push is O(1): running sum and sum of squares. The sums are rebuilt
/// from the window once per `size` pushes so float drift cannot accumulate
/// over a multi-day run.
#[derive(Debug, Clone)]
pub struct RollingStdDev {
    values: VecDeque<f64>,
    size: usize,
    sum: f64,
    sum_sq: f64,
    since_rebuild: usize,
}

impl RollingStdDev {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        Self {
            values: VecDeque::with_capacity(size),
            size,
            sum: 0.0,
            sum_sq: 0.0,
            since_rebuild: 0,
        }
    }

    /// Window size for `window_ms` of samples at `sample_rate_hz`
    pub fn for_window(window_ms: u64, sample_rate_hz: u32) -> Self {
        Self::new((window_ms as usize * sample_rate_hz as usize) / 1000)
    }

    /// Add a value; returns the deviation once the window is full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.values.len() == self.size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;

        self.since_rebuild += 1;
        if self.since_rebuild >= self.size {
            self.rebuild();
        }

        self.value()
    }

    /// Current deviation, `None` until the window has filled
    pub fn value(&self) -> Option<f64> {
        if self.values.len() < self.size {
            return None;
        }
        let n = self.size as f64;
        let mean = self.sum / n;
        Some((self.sum_sq / n - mean * mean).max(0.0).sqrt())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.size
    }

    fn rebuild(&mut self) {
        self.sum = self.values.iter().sum();
        self.sum_sq = self.values.iter().map(|v| v * v).sum();
        self.since_rebuild = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_stddev(values: &[f64]) -> f64 {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
    }

    #[test]
    fn test_stateless_metrics() {
        let sample = Sample::accel(0.0, -0.6, -0.8, 1.0);
        assert_eq!(hard_brake(&sample), 0.6);
        assert_eq!(big_corner(&sample), 0.8);
        assert!((high_g(&sample) - 1.0).abs() < 1e-12);
        assert_eq!(instantaneous(EventType::RoughRoad, &sample), None);
        assert_eq!(instantaneous(EventType::BigCorner, &sample), Some(0.8));
    }

    #[test]
    fn test_acceleration_is_not_braking() {
        let sample = Sample::accel(0.0, 0.7, 0.0, 1.0);
        assert!(hard_brake(&sample) < 0.0);
    }

    #[test]
    fn test_rolling_stddev_waits_for_full_window() {
        let mut stddev = RollingStdDev::new(4);
        assert_eq!(stddev.push(1.0), None);
        assert_eq!(stddev.push(1.0), None);
        assert_eq!(stddev.push(1.0), None);
        assert_eq!(stddev.push(1.0), Some(0.0));
    }

    #[test]
    fn test_rolling_stddev_matches_naive() {
        let values: Vec<f64> = (0..500).map(|i| 1.0 + ((i * 37) % 11) as f64 * 0.05).collect();
        let mut stddev = RollingStdDev::new(50);

        for (i, v) in values.iter().enumerate() {
            let got = stddev.push(*v);
            if i + 1 >= 50 {
                let expected = naive_stddev(&values[i + 1 - 50..=i]);
                assert!((got.unwrap() - expected).abs() < 1e-9, "at {}", i);
            }
        }
    }

    #[test]
    fn test_window_size_from_rate() {
        assert_eq!(RollingStdDev::for_window(1000, 100).size(), 100);
        assert_eq!(RollingStdDev::for_window(500, 200).size(), 100);
        // Never degenerate
        assert_eq!(RollingStdDev::for_window(1, 50).size(), 2);
    }
}
