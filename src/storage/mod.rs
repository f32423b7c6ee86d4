//! # Storage Module
//!
//! Durable, offline-first record store.
//!
//! This module handles:
//! - The SQLite-backed [`StorageEngine`], its sync cursor API and retention
//! - Boot recovery after an unclean stop
//! - The writer task that owns every commit

pub mod engine;
pub mod models;
pub mod recovery;
pub mod writer;

pub use engine::{PruneReport, RetentionPolicy, StorageEngine};
pub use models::{DurableRecord, Reading, RecordId, RecordPayload, SensorType, SyncCursor};
pub use recovery::{run_boot_recovery, spawn_boot_recovery, RecoveryReport};
pub use writer::{record_channel, RecordSink, StorageCommand, StorageWriter, WriterStats};
