//! # Boot Recovery
//!
//! Runs once per start, before the pipeline produces new records:
//!
//! 1. After an unclean stop, validate the store (`quick_check` and schema
//!    revision). An unusable store is logged at error level and replaced
//!    by a fresh one. Startup is never aborted for it.
//! 2. Close every event left `active` as `interrupted`.
//!
//! Sync cursors are never touched: records that were already sent stay
//! sent, even if the store was replaced.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::engine::{StorageEngine, SCHEMA_VERSION};
use crate::sensor::unix_now;

/// Outcome of boot recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub was_crash: bool,
    pub integrity_ok: bool,
    pub reinitialized: bool,
    pub orphans_closed: usize,
}

/// Run recovery to completion on the calling thread
pub fn run_boot_recovery(engine: &StorageEngine, was_crash: bool) -> RecoveryReport {
    let mut report = RecoveryReport {
        was_crash,
        integrity_ok: true,
        ..RecoveryReport::default()
    };

    if was_crash {
        if let Err(reason) = verify(engine) {
            report.integrity_ok = false;
            error!(reason = %reason, "Store failed integrity check after unclean stop");
            match engine.reinitialize() {
                Ok(_) => report.reinitialized = true,
                Err(e) => error!(error = %e, "Failed to reinitialise store"),
            }
        } else {
            info!("Integrity check passed");
        }
    }

    match engine.close_orphans(unix_now()) {
        Ok(closed) => report.orphans_closed = closed,
        Err(e) => error!(error = %e, "Failed to close orphaned events"),
    }

    if was_crash {
        info!(
            integrity_ok = report.integrity_ok,
            reinitialized = report.reinitialized,
            orphans_closed = report.orphans_closed,
            "Crash recovery complete"
        );
    } else {
        info!(orphans_closed = report.orphans_closed, "Clean boot");
    }
    report
}

fn verify(engine: &StorageEngine) -> std::result::Result<(), String> {
    let lines = engine.quick_check().map_err(|e| e.to_string())?;
    if lines != ["ok"] {
        return Err(format!("quick_check: {}", lines.join("; ")));
    }

    match engine.schema_version().map_err(|e| e.to_string())? {
        Some(SCHEMA_VERSION) => Ok(()),
        other => Err(format!("schema version {:?}, expected {}", other, SCHEMA_VERSION)),
    }
}

/// Run recovery on the blocking pool, waiting at most `grace` for it.
///
/// Returns `None` if recovery is still running when the grace period ends;
/// it then finishes in the background while startup continues.
pub async fn spawn_boot_recovery(
    engine: Arc<StorageEngine>,
    was_crash: bool,
    grace: Duration,
) -> Option<RecoveryReport> {
    let handle = tokio::task::spawn_blocking(move || run_boot_recovery(&engine, was_crash));

    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            error!(error = %e, "Boot recovery task failed");
            None
        }
        Err(_) => {
            warn!(grace_ms = grace.as_millis() as u64, "Boot recovery still running, continuing startup");
            None
        }
    }
}
