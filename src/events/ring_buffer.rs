//! # Sample Ring Buffer
//!
//! Fixed-duration window of recent samples held in RAM.
//!
//! Storage is allocated once (`capacity = rate × window_seconds`); once full
//! every push overwrites the oldest slot. One writer (the acquisition loop)
//! and any number of readers share it through an `Arc`. Readers always get a
//! copy of the slice they asked for, never a reference into the buffer, so a
//! concurrent push can never tear a read.
//!
//! ## Usage
//!
//! ```
//! use roadrecorder::events::RingBuffer;
//! use roadrecorder::sensor::Sample;
//!
//! let buffer = RingBuffer::new(30.0, 100);
//! for i in 0..3000 {
//!     buffer.push(Sample::accel(i as f64 / 100.0, 0.0, 0.0, 1.0));
//! }
//! assert_eq!(buffer.window(30.0).len(), 3000);
//! assert_eq!(buffer.window(60.0).len(), 3000); // clamped to the span
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::sensor::Sample;

struct Ring {
    slots: Vec<Sample>,
    /// Next slot to write; the oldest sample once the ring is full
    head: usize,
    capacity: usize,
}

impl Ring {
    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Logical index: 0 is the oldest sample
    fn get(&self, index: usize) -> &Sample {
        let start = if self.slots.len() < self.capacity { 0 } else { self.head };
        &self.slots[(start + index) % self.capacity]
    }

    fn push(&mut self, sample: Sample) {
        if self.slots.len() < self.capacity {
            self.slots.push(sample);
        } else {
            self.slots[self.head] = sample;
        }
        self.head = (self.head + 1) % self.capacity;
    }
}

/// Thread-safe ring buffer of IMU samples
pub struct RingBuffer {
    inner: Mutex<Ring>,
    capacity: usize,
    span_seconds: f64,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("span_seconds", &self.span_seconds)
            .field("len", &self.len())
            .finish()
    }
}

impl RingBuffer {
    /// Create a buffer retaining `window_seconds` of samples at `sample_rate_hz`.
    #[must_use]
    pub fn new(window_seconds: f64, sample_rate_hz: u32) -> Self {
        let capacity = ((window_seconds * f64::from(sample_rate_hz)).round() as usize).max(1);
        Self {
            inner: Mutex::new(Ring {
                slots: Vec::with_capacity(capacity),
                head: 0,
                capacity,
            }),
            capacity,
            span_seconds: window_seconds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // A panicked reader cannot leave the ring half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample, evicting the oldest one when full. O(1).
    pub fn push(&self, sample: Sample) {
        self.lock().push(sample);
    }

    /// Samples with `timestamp >= newest - seconds`, oldest first.
    ///
    /// `seconds` is clamped to the configured span. Allocates exactly the
    /// number of samples returned.
    pub fn window(&self, seconds: f64) -> Vec<Sample> {
        let ring = self.lock();
        let len = ring.len();
        if len == 0 {
            return Vec::new();
        }

        let seconds = if seconds.is_nan() { 0.0 } else { seconds.clamp(0.0, self.span_seconds) };
        let cutoff = ring.get(len - 1).timestamp - seconds;

        let count = (0..len)
            .rev()
            .take_while(|&i| ring.get(i).timestamp >= cutoff)
            .count();

        let mut out = Vec::with_capacity(count);
        out.extend((len - count..len).map(|i| *ring.get(i)));
        out
    }

    /// Copy of every sample currently held, oldest first
    pub fn all(&self) -> Vec<Sample> {
        let ring = self.lock();
        let mut out = Vec::with_capacity(ring.len());
        out.extend((0..ring.len()).map(|i| *ring.get(i)));
        out
    }

    /// Most recent sample, if any.
    ///
    /// Cheap enough for low-rate collaborators (status display, snapshot
    /// collector) to poll without touching the acquisition path.
    pub fn latest(&self) -> Option<Sample> {
        let ring = self.lock();
        ring.len().checked_sub(1).map(|i| *ring.get(i))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of samples retained
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured retention window in seconds
    pub fn span_seconds(&self) -> f64 {
        self.span_seconds
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Time covered by the samples currently held
    pub fn duration(&self) -> f64 {
        let ring = self.lock();
        match ring.len() {
            0 | 1 => 0.0,
            n => ring.get(n - 1).timestamp - ring.get(0).timestamp,
        }
    }

    pub fn clear(&self) {
        let mut ring = self.lock();
        ring.slots.clear();
        ring.head = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn sample_at(t: f64) -> Sample {
        Sample::accel(t, 0.0, 0.0, 1.0)
    }

    fn fill(buffer: &RingBuffer, count: usize, rate_hz: f64) {
        for i in 0..count {
            buffer.push(sample_at(i as f64 / rate_hz));
        }
    }

    #[test]
    fn test_capacity_from_rate_and_window() {
        let buffer = RingBuffer::new(30.0, 100);
        assert_eq!(buffer.capacity(), 3000);
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_empty_window() {
        let buffer = RingBuffer::new(30.0, 100);
        assert!(buffer.window(10.0).is_empty());
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.duration(), 0.0);
    }

    #[test]
    fn test_full_span_scenario() {
        let buffer = RingBuffer::new(30.0, 100);
        fill(&buffer, 3000, 100.0);

        assert!(buffer.is_full());
        assert_eq!(buffer.window(30.0).len(), 3000);
        assert_eq!(buffer.window(60.0).len(), 3000);
    }

    #[test]
    fn test_window_is_time_bounded() {
        let buffer = RingBuffer::new(30.0, 100);
        fill(&buffer, 3000, 100.0);

        // Newest is 29.99; 1s back admits 29.00..=29.99 (rounding aside)
        let window = buffer.window(1.0);
        assert!((100..=101).contains(&window.len()), "got {}", window.len());
        assert_eq!(window.last().unwrap().timestamp, 29.99);

        let window = buffer.window(0.0);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_overflow_never_exceeds_capacity_and_stays_ordered() {
        for (window_s, rate, pushes) in [(1.0, 10, 11), (1.0, 10, 95), (2.0, 50, 1000), (30.0, 100, 7777)] {
            let buffer = RingBuffer::new(window_s, rate);
            fill(&buffer, pushes, f64::from(rate));

            let window = buffer.window(window_s);
            assert!(window.len() <= buffer.capacity());
            assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

            let all = buffer.all();
            assert_eq!(all.len(), buffer.capacity());
            assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            // The oldest survivors are exactly the most recent `capacity` pushes
            let first_kept = pushes - buffer.capacity();
            assert_eq!(all[0].timestamp, first_kept as f64 / f64::from(rate));
        }
    }

    #[test]
    fn test_latest_and_duration() {
        let buffer = RingBuffer::new(1.0, 10);
        fill(&buffer, 25, 10.0);

        assert_eq!(buffer.latest().unwrap().timestamp, 2.4);
        assert!((buffer.duration() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_negative_and_nan_seconds() {
        let buffer = RingBuffer::new(1.0, 10);
        fill(&buffer, 5, 10.0);

        assert_eq!(buffer.window(-3.0).len(), 1);
        assert_eq!(buffer.window(f64::NAN).len(), 1);
    }

    #[test]
    fn test_clear() {
        let buffer = RingBuffer::new(1.0, 10);
        fill(&buffer, 15, 10.0);
        buffer.clear();

        assert!(buffer.is_empty());
        buffer.push(sample_at(100.0));
        assert_eq!(buffer.all(), vec![sample_at(100.0)]);
    }

    #[test]
    fn test_concurrent_reader_sees_ordered_copies() {
        let buffer = Arc::new(RingBuffer::new(1.0, 100));

        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let window = buffer.window(1.0);
                    assert!(window.len() <= buffer.capacity());
                    assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                }
            })
        };

        fill(&buffer, 5000, 100.0);
        reader.join().unwrap();
    }
}
