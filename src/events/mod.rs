//! # Events Module
//!
//! Real-time driving event detection on the 100Hz sample stream.
//!
//! This module handles:
//! - Keeping the last N seconds of samples in a ring buffer
//! - Deriving one metric per event type from each sample
//! - Running the per-type Idle/Active state machine with dwell and cooldown
//! - Producing finalized [`Event`] records with stable identities

pub mod detector;
pub mod metrics;
pub mod ring_buffer;
pub mod types;

pub use detector::{DetectorEvent, EventDetector};
pub use ring_buffer::RingBuffer;
pub use types::{Event, EventId, EventStart, EventStatus, EventSummary, EventType, Peaks};
