//! # Road Recorder Library
//!
//! Crash-tolerant vehicle telemetry: 100Hz IMU sampling, driving event
//! detection, a durable offline-first store and a self-healing watchdog.
//!
//! This library provides the components the `roadrecorder` daemon is
//! composed from. Each one can be built and driven on its own, which is how
//! the tests exercise them.

pub mod acquisition;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod sensor;
pub mod storage;
pub mod watchdog;
