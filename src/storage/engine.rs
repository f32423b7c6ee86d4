//! # Storage Engine
//!
//! Crash-safe append store on SQLite.
//!
//! ## Durability
//!
//! The store runs in WAL mode with `synchronous = FULL`, so a write that
//! has returned survives power loss. Automatic checkpoints are disabled;
//! the writer task folds the WAL back into the main file on a long interval
//! through [`StorageEngine::checkpoint`], never inside a commit.
//!
//! A clean [`StorageEngine::close`] truncates and removes the `-wal` file.
//! Its presence before [`StorageEngine::open`] therefore means the previous
//! run stopped without closing the store.
//!
//! ## Connections
//!
//! One write connection behind a mutex serialises every writer. A separate
//! read-only connection serves sync queries, so readers only ever wait for
//! WAL snapshot setup, never for a writer's transaction.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::models::{DurableRecord, RecordId, RecordPayload, SyncCursor};
use crate::config::StorageConfig;
use crate::error::{RecorderError, Result};
use crate::events::{Event, EventId, EventStart, EventStatus, EventSummary, EventType};
use crate::sensor::unix_now;

/// Current schema revision
pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a sync batch allocated up front
const MAX_PREALLOC: usize = 1024;

/// Events deleted per round of size-driven pruning; records go 16x faster
const PRUNE_CHUNK: i64 = 32;

const SECONDS_PER_DAY: u64 = 86_400;

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = FULL;
    PRAGMA wal_autocheckpoint = 0;
";

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL,
        applied_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        event_id TEXT,
        recorded_at TEXT NOT NULL,
        payload TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time REAL NOT NULL,
        end_time REAL,
        peak_value REAL,
        peak_ax REAL,
        peak_ay REAL,
        peak_az REAL,
        sample_count INTEGER NOT NULL DEFAULT 0,
        samples TEXT,
        updated_at REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);

    CREATE TABLE IF NOT EXISTS sync_cursors (
        name TEXT PRIMARY KEY,
        last_synced_id INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );
";

/// `<db><suffix>`, e.g. the `-wal` sidecar
pub fn sidecar(db: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn lock(conn: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Age and size limits applied by [`StorageEngine::prune`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Finished events and confirmed records older than this are deleted
    pub max_age: Option<Duration>,
    /// Live bytes above which the oldest prunable data is deleted
    pub max_bytes: Option<u64>,
}

impl RetentionPolicy {
    /// A zero limit in the config disables that limit
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            max_age: (config.max_event_age_days > 0)
                .then(|| Duration::from_secs(config.max_event_age_days * SECONDS_PER_DAY)),
            max_bytes: (config.max_db_size_mb > 0).then(|| config.max_db_size_mb * 1024 * 1024),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_age.is_none() && self.max_bytes.is_none()
    }
}

/// What one [`StorageEngine::prune`] pass deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub events: u64,
    pub records: u64,
    /// The file was compacted after a size-driven prune
    pub vacuumed: bool,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.events == 0 && self.records == 0
    }
}

/// Durable append store with sync cursors
pub struct StorageEngine {
    path: PathBuf,
    writer: Mutex<Option<Connection>>,
    reader: Mutex<Option<Connection>>,
    /// Commits since the last checkpoint
    dirty: AtomicBool,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine").field("path", &self.path).finish()
    }
}

impl StorageEngine {
    /// Open or create the store at `path`.
    ///
    /// Returns the engine and whether the previous run stopped uncleanly.
    /// A file that cannot be opened as a store is moved aside and replaced
    /// by a fresh one; only a failure to create that fresh store is an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Must be sampled before the first connection recreates the WAL
        let was_crash = sidecar(&path, "-wal").exists();

        let (writer, reader) = match open_connections(&path) {
            Ok(connections) => connections,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Store cannot be opened, reinitialising");
                move_aside(&path)?;
                open_connections(&path)?
            }
        };

        if was_crash {
            warn!(path = %path.display(), "Store was not closed cleanly");
        } else {
            info!(path = %path.display(), "Store opened");
        }

        Ok((
            Self {
                path,
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
                dirty: AtomicBool::new(false),
            },
            was_crash,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.writer);
        let conn = guard.as_mut().ok_or(RecorderError::StorageClosed)?;
        f(conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = lock(&self.reader);
        let conn = guard.as_ref().ok_or(RecorderError::StorageClosed)?;
        f(conn)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Append one record. Durable once this returns.
    pub fn append(&self, payload: &RecordPayload) -> Result<RecordId> {
        let id = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let id = insert_record(&tx, payload)?;
            tx.commit()?;
            Ok(id)
        })?;
        self.mark_dirty();
        Ok(id)
    }

    /// Append several records in one transaction, ids in input order
    pub fn append_batch(&self, payloads: &[RecordPayload]) -> Result<Vec<RecordId>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let ids = payloads
                .iter()
                .map(|payload| insert_record(&tx, payload))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(ids)
        })?;
        self.mark_dirty();
        Ok(ids)
    }

    /// Persist the "active" marker of a started event
    pub fn record_event_started(&self, start: &EventStart) -> Result<()> {
        self.with_writer(|conn| {
            conn.execute(
                "INSERT INTO events (event_id, event_type, status, start_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    start.id.to_string(),
                    start.event_type.as_str(),
                    EventStatus::Active.as_str(),
                    start.start_time,
                    unix_now(),
                ],
            )?;
            Ok(())
        })?;
        self.mark_dirty();
        debug!(event_id = %start.id, "Active event persisted");
        Ok(())
    }

    /// Persist a completed event and its sync record atomically
    pub fn record_event_completed(&self, event: &Event) -> Result<RecordId> {
        let samples = serde_json::to_string(&event.samples)?;
        let payload = RecordPayload::Event(event.summary());

        let id = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO events (event_id, event_type, status, start_time, end_time,
                                     peak_value, peak_ax, peak_ay, peak_az,
                                     sample_count, samples, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(event_id) DO UPDATE SET
                     status = excluded.status,
                     end_time = excluded.end_time,
                     peak_value = excluded.peak_value,
                     peak_ax = excluded.peak_ax,
                     peak_ay = excluded.peak_ay,
                     peak_az = excluded.peak_az,
                     sample_count = excluded.sample_count,
                     samples = excluded.samples,
                     updated_at = excluded.updated_at",
                params![
                    event.id.to_string(),
                    event.event_type.as_str(),
                    event.status.as_str(),
                    event.start_time,
                    event.end_time,
                    event.peaks.value,
                    event.peaks.ax,
                    event.peaks.ay,
                    event.peaks.az,
                    event.sample_count as i64,
                    samples,
                    unix_now(),
                ],
            )?;
            let id = insert_record(&tx, &payload)?;
            tx.commit()?;
            Ok(id)
        })?;
        self.mark_dirty();
        Ok(id)
    }

    /// Stored status of an event, if known
    pub fn event_status(&self, id: &EventId) -> Result<Option<EventStatus>> {
        self.with_reader(|conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM events WHERE event_id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            status
                .map(|s| s.parse().map_err(RecorderError::Integrity))
                .transpose()
        })
    }

    /// Close every event still marked active.
    ///
    /// Each becomes `interrupted` with an end time of its last update,
    /// clamped to `[start, now]`, and gets an event record for sync. The
    /// status guard makes a second pass over the same row a no-op. Rows
    /// that cannot be decoded are logged and left untouched.
    pub fn close_orphans(&self, now: f64) -> Result<usize> {
        let closed = self.with_writer(|conn| {
            let rows = {
                let mut stmt = conn.prepare(
                    "SELECT event_id, event_type, start_time, updated_at,
                            peak_value, peak_ax, peak_ay, peak_az, sample_count
                     FROM events WHERE status = ?1",
                )?;
                let rows = stmt.query_map(params![EventStatus::Active.as_str()], |row| {
                    Ok(OrphanRow {
                        event_id: row.get(0)?,
                        event_type: row.get(1)?,
                        start_time: row.get(2)?,
                        updated_at: row.get(3)?,
                        peak_value: row.get(4)?,
                        peak_ax: row.get(5)?,
                        peak_ay: row.get(6)?,
                        peak_az: row.get(7)?,
                        sample_count: row.get(8)?,
                    })
                })?;
                rows.collect::<Vec<rusqlite::Result<OrphanRow>>>()
            };

            let mut closed = 0;
            for row in rows {
                let summary = match row.map_err(RecorderError::from).and_then(|r| r.interrupt(now)) {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable orphaned event");
                        continue;
                    }
                };

                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE events SET status = ?1, end_time = ?2, updated_at = ?3
                     WHERE event_id = ?4 AND status = ?5",
                    params![
                        EventStatus::Interrupted.as_str(),
                        summary.end_time,
                        now,
                        summary.id.to_string(),
                        EventStatus::Active.as_str(),
                    ],
                )?;
                if changed == 1 {
                    insert_record(&tx, &RecordPayload::Event(summary.clone()))?;
                    closed += 1;
                    info!(
                        event_id = %summary.id,
                        event_type = %summary.event_type,
                        end_time = summary.end_time,
                        "Orphaned event closed"
                    );
                }
                tx.commit()?;
            }
            Ok(closed)
        })?;

        if closed > 0 {
            self.mark_dirty();
        }
        Ok(closed)
    }

    /// `PRAGMA quick_check` result lines; `["ok"]` when healthy
    pub fn quick_check(&self) -> Result<Vec<String>> {
        self.with_writer(|conn| {
            let mut stmt = conn.prepare("PRAGMA quick_check")?;
            let lines = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(lines)
        })
    }

    /// Highest applied schema revision
    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.with_writer(|conn| {
            let version = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
            Ok(version)
        })
    }

    /// Records with `id > cursor`, ascending, at most `limit`.
    ///
    /// A row that cannot be decoded is logged and skipped, and the scan
    /// continues past it. Consumers advance their cursor to the last id
    /// returned, so a corrupt row never holds back the records after it.
    pub fn unsynced_since(&self, cursor: RecordId, limit: usize) -> Result<Vec<DurableRecord>> {
        let mut records = Vec::with_capacity(limit.min(MAX_PREALLOC));
        let mut scan_from = cursor as i64;

        while records.len() < limit {
            let wanted = limit - records.len();
            let rows = self.with_reader(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, recorded_at, payload FROM records
                     WHERE id > ?1
                     ORDER BY id ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![scan_from, wanted as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;

            let fetched = rows.len();
            for (id, recorded_at, payload) in rows {
                scan_from = id;
                match decode_record(id, &recorded_at, &payload) {
                    Ok(record) => records.push(record),
                    Err(e) => error!(record_id = id, error = %e, "Skipping undecodable record"),
                }
            }
            if fetched < wanted {
                break;
            }
        }

        Ok(records)
    }

    /// Cursor state for a consumer; id 0 if it has never advanced
    pub fn sync_cursor(&self, name: &str) -> Result<SyncCursor> {
        let row = self.with_reader(|conn| {
            let row = conn
                .query_row(
                    "SELECT last_synced_id, updated_at FROM sync_cursors WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row)
        })?;

        Ok(match row {
            Some((id, updated_at)) => SyncCursor {
                name: name.to_string(),
                last_synced_id: id as RecordId,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            },
            None => SyncCursor {
                name: name.to_string(),
                last_synced_id: 0,
                updated_at: None,
            },
        })
    }

    pub fn cursor(&self, name: &str) -> Result<RecordId> {
        Ok(self.sync_cursor(name)?.last_synced_id)
    }

    /// Move a consumer's cursor forward to `to`.
    ///
    /// Never moves backward and never past the newest record. Returns the
    /// resulting cursor.
    pub fn advance_cursor(&self, name: &str, to: RecordId) -> Result<RecordId> {
        let cursor = self.with_writer(|conn| {
            let tx = conn.transaction()?;
            // Pruning may have emptied the table; the sequence still knows the head
            let head: i64 = tx.query_row(
                "SELECT COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'records'), 0)",
                [],
                |row| row.get(0),
            )?;
            let target = (to as i64).min(head);

            tx.execute(
                "INSERT INTO sync_cursors (name, last_synced_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                     last_synced_id = MAX(last_synced_id, excluded.last_synced_id),
                     updated_at = excluded.updated_at",
                params![name, target, now_rfc3339()],
            )?;
            let cursor: i64 = tx.query_row(
                "SELECT last_synced_id FROM sync_cursors WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(cursor as RecordId)
        })?;
        self.mark_dirty();
        debug!(cursor = name, to = cursor, "Sync cursor advanced");
        Ok(cursor)
    }

    /// Records a consumer has not yet confirmed
    pub fn backlog(&self, name: &str) -> Result<u64> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records
                 WHERE id > COALESCE((SELECT last_synced_id FROM sync_cursors WHERE name = ?1), 0)",
                params![name],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    pub fn record_count(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Delete data past its retention limits.
    ///
    /// Only events that are no longer active are deleted, with their
    /// samples. A record is deleted only once every sync consumer has
    /// confirmed it, so with no consumer registered no record is ever
    /// deleted. Over the size limit the oldest prunable data goes first
    /// until the store is back under 90% of the limit, then the file is
    /// compacted.
    pub fn prune(&self, policy: &RetentionPolicy, now: f64) -> Result<PruneReport> {
        if policy.is_disabled() {
            return Ok(PruneReport::default());
        }

        let report = self.with_writer(|conn| {
            let mut report = PruneReport::default();
            let confirmed: i64 = conn.query_row(
                "SELECT COALESCE(MIN(last_synced_id), 0) FROM sync_cursors",
                [],
                |row| row.get(0),
            )?;

            if let Some(max_age) = policy.max_age {
                let cutoff = now - max_age.as_secs_f64();
                let cutoff_rfc3339 = Utc
                    .timestamp_millis_opt((cutoff * 1000.0) as i64)
                    .single()
                    .ok_or_else(|| RecorderError::Integrity(format!("retention cutoff {} out of range", cutoff)))?
                    .to_rfc3339_opts(SecondsFormat::Micros, true);

                let tx = conn.transaction()?;
                report.events += tx.execute(
                    "DELETE FROM events WHERE status != ?1 AND start_time < ?2",
                    params![EventStatus::Active.as_str(), cutoff],
                )? as u64;
                report.records += tx.execute(
                    "DELETE FROM records WHERE id <= ?1 AND recorded_at < ?2",
                    params![confirmed, cutoff_rfc3339],
                )? as u64;
                tx.commit()?;
            }

            if let Some(max_bytes) = policy.max_bytes {
                let mut used = live_bytes(conn)?;
                if used > max_bytes {
                    let target = max_bytes / 10 * 9;
                    let mut deleted_any = false;
                    while used > target {
                        let tx = conn.transaction()?;
                        let events = tx.execute(
                            "DELETE FROM events WHERE event_id IN (
                                 SELECT event_id FROM events WHERE status != ?1
                                 ORDER BY start_time ASC LIMIT ?2)",
                            params![EventStatus::Active.as_str(), PRUNE_CHUNK],
                        )?;
                        let records = tx.execute(
                            "DELETE FROM records WHERE id IN (
                                 SELECT id FROM records WHERE id <= ?1
                                 ORDER BY id ASC LIMIT ?2)",
                            params![confirmed, PRUNE_CHUNK * 16],
                        )?;
                        tx.commit()?;

                        if events + records == 0 {
                            warn!(used, max_bytes, "Store over size limit, the rest is active or unsynced");
                            break;
                        }
                        deleted_any = true;
                        report.events += events as u64;
                        report.records += records as u64;
                        used = live_bytes(conn)?;
                    }

                    if deleted_any {
                        match conn.execute_batch("VACUUM") {
                            Ok(()) => report.vacuumed = true,
                            Err(e) => warn!(error = %e, "VACUUM after prune failed"),
                        }
                    }
                }
            }
            Ok(report)
        })?;

        if !report.is_empty() {
            self.mark_dirty();
            info!(
                events = report.events,
                records = report.records,
                vacuumed = report.vacuumed,
                "Store pruned"
            );
        }
        Ok(report)
    }

    /// Bytes held by live pages, excluding the free list
    pub fn live_bytes(&self) -> Result<u64> {
        self.with_writer(|conn| live_bytes(conn))
    }

    /// Fold the WAL into the main file and truncate it.
    ///
    /// Returns `false` without touching the file when nothing was written
    /// since the last checkpoint.
    pub fn checkpoint(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let (busy, log_frames, checkpointed) = self.with_writer(|conn| {
            let result = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            Ok(result)
        })?;

        if busy != 0 {
            // A reader held an old snapshot; try again next interval
            self.mark_dirty();
            warn!(log_frames, checkpointed, "WAL checkpoint incomplete");
        } else {
            debug!(log_frames, checkpointed, "WAL checkpoint complete");
        }
        Ok(true)
    }

    /// Replace the store with a fresh, empty one.
    ///
    /// The old files are renamed with a `.corrupt-<timestamp>` suffix.
    /// Returns the new location of the old main file, if there was one.
    pub fn reinitialize(&self) -> Result<Option<PathBuf>> {
        let mut writer = lock(&self.writer);
        let mut reader = lock(&self.reader);

        drop(reader.take());
        drop(writer.take());

        let moved = move_aside(&self.path)?;
        let (new_writer, new_reader) = open_connections(&self.path)?;
        *writer = Some(new_writer);
        *reader = Some(new_reader);
        self.dirty.store(false, Ordering::Release);

        warn!(
            path = %self.path.display(),
            moved_to = ?moved,
            "Store reinitialised"
        );
        Ok(moved)
    }

    /// Checkpoint, truncate the WAL and close both connections.
    ///
    /// Every later call returns [`RecorderError::StorageClosed`].
    pub fn close(&self) -> Result<()> {
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.close().map_err(|(_, e)| e)?;
        }

        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            writer.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            writer.close().map_err(|(_, e)| e)?;
            info!(path = %self.path.display(), "Store closed cleanly");
        }
        Ok(())
    }
}

fn open_connections(path: &Path) -> Result<(Connection, Connection)> {
    let writer = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    writer.busy_timeout(BUSY_TIMEOUT)?;
    writer.execute_batch(PRAGMAS)?;

    let mode: String = writer.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(RecorderError::Integrity(format!("journal mode is {}, expected wal", mode)));
    }

    writer.execute_batch(SCHEMA_SQL)?;
    writer.execute(
        "INSERT INTO schema_version (version, applied_at)
         SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        params![SCHEMA_VERSION, now_rfc3339()],
    )?;

    let reader = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    reader.busy_timeout(BUSY_TIMEOUT)?;

    Ok((writer, reader))
}

fn live_bytes(conn: &Connection) -> Result<u64> {
    let pragma = |name: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("PRAGMA {}", name), [], |row| row.get(0))?)
    };
    let live_pages = (pragma("page_count")? - pragma("freelist_count")?).max(0);
    Ok((live_pages * pragma("page_size")?) as u64)
}

/// Rename the store and its sidecars out of the way
fn move_aside(path: &Path) -> Result<Option<PathBuf>> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let aside = sidecar(path, &format!(".corrupt-{}", stamp));

    let mut moved = None;
    for suffix in ["", "-wal", "-shm"] {
        let from = sidecar(path, suffix);
        if from.exists() {
            let to = sidecar(&aside, suffix);
            fs::rename(&from, &to)?;
            if suffix.is_empty() {
                moved = Some(to);
            }
        }
    }
    Ok(moved)
}

fn decode_record(id: i64, recorded_at: &str, payload: &str) -> Result<DurableRecord> {
    let recorded_at = DateTime::parse_from_rfc3339(recorded_at)
        .map_err(|e| RecorderError::Integrity(format!("record {}: bad timestamp: {}", id, e)))?
        .with_timezone(&Utc);
    Ok(DurableRecord {
        id: id as RecordId,
        recorded_at,
        payload: serde_json::from_str(payload)?,
    })
}

fn insert_record(conn: &Connection, payload: &RecordPayload) -> Result<RecordId> {
    conn.execute(
        "INSERT INTO records (kind, event_id, recorded_at, payload) VALUES (?1, ?2, ?3, ?4)",
        params![
            payload.kind(),
            payload.event_id().map(|id| id.to_string()),
            now_rfc3339(),
            serde_json::to_string(payload)?,
        ],
    )?;
    Ok(conn.last_insert_rowid() as RecordId)
}

struct OrphanRow {
    event_id: String,
    event_type: String,
    start_time: f64,
    updated_at: Option<f64>,
    peak_value: Option<f64>,
    peak_ax: Option<f64>,
    peak_ay: Option<f64>,
    peak_az: Option<f64>,
    sample_count: i64,
}

impl OrphanRow {
    fn interrupt(self, now: f64) -> Result<EventSummary> {
        let id: EventId = self
            .event_id
            .parse()
            .map_err(|e| RecorderError::Integrity(format!("event id {:?}: {}", self.event_id, e)))?;
        let event_type: EventType = self.event_type.parse().map_err(RecorderError::Integrity)?;
        if !self.start_time.is_finite() {
            return Err(RecorderError::Integrity(format!("event {}: start time not finite", id)));
        }

        let end = self
            .updated_at
            .filter(|t| t.is_finite())
            .unwrap_or(self.start_time)
            .min(now)
            .max(self.start_time);

        Ok(EventSummary {
            id,
            event_type,
            status: EventStatus::Interrupted,
            start_time: self.start_time,
            end_time: Some(end),
            duration_ms: Some(((end - self.start_time) * 1000.0).round() as i64),
            peak_value: self.peak_value.unwrap_or(0.0),
            peak_ax: self.peak_ax.unwrap_or(0.0),
            peak_ay: self.peak_ay.unwrap_or(0.0),
            peak_az: self.peak_az.unwrap_or(0.0),
            sample_count: self.sample_count.max(0) as u64,
        })
    }
}
