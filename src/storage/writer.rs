//! # Storage Writer
//!
//! The only task that commits to the store.
//!
//! Producers submit [`StorageCommand`]s through a [`RecordSink`] backed by a
//! bounded channel. The acquisition thread uses [`RecordSink::try_submit`],
//! which drops and counts when the queue is full instead of blocking the
//! sample loop. Async producers may wait with [`RecordSink::submit`].
//!
//! Commands are committed in submission order. Each commit runs on the
//! blocking pool so a slow flash write never stalls the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::engine::{RetentionPolicy, StorageEngine};
use super::models::{Reading, RecordPayload};
use crate::config::StorageConfig;
use crate::error::{RecorderError, Result};
use crate::events::{Event, EventStart};
use crate::sensor::unix_now;
use crate::watchdog::Heartbeat;

/// Commands drained per commit round
const MAX_BATCH: usize = 256;

/// Work item for the writer task
#[derive(Debug, Clone)]
pub enum StorageCommand {
    EventStarted(EventStart),
    EventCompleted(Box<Event>),
    Reading(Reading),
}

/// Producer handle for the writer task
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<StorageCommand>,
    dropped: Arc<AtomicU64>,
}

impl RecordSink {
    /// Queue a command without blocking.
    ///
    /// Returns `false` if the queue was full or the writer has stopped;
    /// the command is dropped and counted.
    pub fn try_submit(&self, command: StorageCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped, "Storage queue full, dropping command");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Storage writer stopped, dropping command");
                false
            }
        }
    }

    /// Queue a command, waiting for space
    pub async fn submit(&self, command: StorageCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RecorderError::ChannelClosed("storage writer"))
    }

    /// Commands dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the writer queue
pub fn record_channel(capacity: usize) -> (RecordSink, mpsc::Receiver<StorageCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        RecordSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Writer task counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub committed: u64,
    pub failed: u64,
    pub checkpoints: u64,
    /// Events and records deleted by retention
    pub pruned: u64,
}

/// Owns every commit to the store
pub struct StorageWriter {
    engine: Arc<StorageEngine>,
    rx: mpsc::Receiver<StorageCommand>,
    heartbeat: Arc<Heartbeat>,
    checkpoint_interval: Duration,
    retention: RetentionPolicy,
    idle_beat: Duration,
    healthy: bool,
    stats: WriterStats,
}

impl StorageWriter {
    pub fn new(
        engine: Arc<StorageEngine>,
        rx: mpsc::Receiver<StorageCommand>,
        heartbeat: Arc<Heartbeat>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            engine,
            rx,
            heartbeat,
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_s),
            retention: RetentionPolicy::from_config(config),
            idle_beat: Duration::from_secs(1),
            healthy: true,
            stats: WriterStats::default(),
        }
    }

    /// Override the checkpoint interval (tests)
    pub fn with_checkpoint_interval(mut self, every: Duration) -> Self {
        self.checkpoint_interval = every;
        self
    }

    /// Override the retention limits (tests)
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Run until `stop` flips or every sink is dropped, then drain the
    /// queue, checkpoint and close the store.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> WriterStats {
        let mut checkpoint = interval_at(Instant::now() + self.checkpoint_interval, self.checkpoint_interval);
        checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle = interval(self.idle_beat);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Storage writer started");

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    let mut batch = vec![command];
                    while batch.len() < MAX_BATCH {
                        match self.rx.try_recv() {
                            Ok(command) => batch.push(command),
                            Err(_) => break,
                        }
                    }
                    self.commit(batch).await;
                }

                _ = checkpoint.tick() => {
                    self.prune().await;
                    self.checkpoint().await;
                }

                _ = idle.tick() => {
                    // An idle writer is a live writer, a failing one is not
                    if self.healthy {
                        self.heartbeat.beat();
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn commit(&mut self, batch: Vec<StorageCommand>) {
        let engine = self.engine.clone();
        let size = batch.len() as u64;

        match tokio::task::spawn_blocking(move || apply(&engine, batch)).await {
            Ok(0) => {
                self.stats.committed += size;
                self.healthy = true;
                self.heartbeat.beat();
            }
            Ok(failed) => {
                self.stats.committed += size - failed;
                self.stats.failed += failed;
                self.healthy = false;
            }
            Err(e) => {
                error!(error = %e, "Storage commit task panicked");
                self.stats.failed += size;
                self.healthy = false;
            }
        }
    }

    async fn prune(&mut self) {
        if self.retention.is_disabled() {
            return;
        }
        let engine = self.engine.clone();
        let retention = self.retention;
        match tokio::task::spawn_blocking(move || engine.prune(&retention, unix_now())).await {
            Ok(Ok(report)) => self.stats.pruned += report.events + report.records,
            Ok(Err(e)) => error!(error = %e, "Retention pass failed"),
            Err(e) => error!(error = %e, "Retention task panicked"),
        }
    }

    async fn checkpoint(&mut self) {
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.checkpoint()).await {
            Ok(Ok(true)) => self.stats.checkpoints += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(error = %e, "WAL checkpoint failed"),
            Err(e) => error!(error = %e, "WAL checkpoint task panicked"),
        }
    }

    async fn shutdown(mut self) -> WriterStats {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Some(command) = self.rx.recv().await {
            remaining.push(command);
        }
        if !remaining.is_empty() {
            info!(pending = remaining.len(), "Draining storage queue");
            for chunk in remaining.chunks(MAX_BATCH) {
                self.commit(chunk.to_vec()).await;
            }
        }

        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to close store cleanly"),
            Err(e) => error!(error = %e, "Store close task panicked"),
        }

        info!(
            committed = self.stats.committed,
            failed = self.stats.failed,
            checkpoints = self.stats.checkpoints,
            pruned = self.stats.pruned,
            "Storage writer stopped"
        );
        self.stats
    }
}

/// Commit a batch in order. Consecutive readings share one transaction.
///
/// Returns the number of commands that failed.
fn apply(engine: &StorageEngine, batch: Vec<StorageCommand>) -> u64 {
    let mut failed = 0;
    let mut readings: Vec<RecordPayload> = Vec::new();

    let flush = |readings: &mut Vec<RecordPayload>, failed: &mut u64| {
        if readings.is_empty() {
            return;
        }
        if let Err(e) = engine.append_batch(readings) {
            error!(error = %e, count = readings.len(), "Failed to append readings");
            *failed += readings.len() as u64;
        }
        readings.clear();
    };

    for command in batch {
        match command {
            StorageCommand::Reading(reading) => readings.push(RecordPayload::Reading(reading)),
            StorageCommand::EventStarted(start) => {
                flush(&mut readings, &mut failed);
                if let Err(e) = engine.record_event_started(&start) {
                    error!(event_id = %start.id, error = %e, "Failed to persist started event");
                    failed += 1;
                }
            }
            StorageCommand::EventCompleted(event) => {
                flush(&mut readings, &mut failed);
                match engine.record_event_completed(&event) {
                    Ok(id) => debug!(event_id = %event.id, record_id = id, "Event committed"),
                    Err(e) => {
                        error!(event_id = %event.id, error = %e, "Failed to persist completed event");
                        failed += 1;
                    }
                }
            }
        }
    }
    flush(&mut readings, &mut failed);

    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStatus, EventType};
    use crate::sensor::Sample;
    use crate::storage::engine::sidecar;
    use crate::watchdog::Component;
    use chrono::Utc;
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    fn setup(capacity: usize) -> (TempDir, Arc<StorageEngine>, RecordSink, StorageWriter, Arc<Heartbeat>) {
        let dir = TempDir::new().unwrap();
        let (engine, _) = StorageEngine::open(dir.path().join("t.db")).unwrap();
        let engine = Arc::new(engine);
        let heartbeat = Arc::new(Heartbeat::new(
            Component::Storage,
            StdInstant::now(),
            Duration::from_secs(30),
            Duration::from_secs(120),
        ));
        let (sink, rx) = record_channel(capacity);
        let writer = StorageWriter::new(engine.clone(), rx, heartbeat.clone(), &StorageConfig::default());
        (dir, engine, sink, writer, heartbeat)
    }

    fn temperature(celsius: f64) -> StorageCommand {
        StorageCommand::Reading(Reading::temperature(Utc::now(), celsius))
    }

    fn event() -> Event {
        let mut event = Event::begin(EventType::BigCorner, &Sample::accel(100.0, 0.0, 0.8, 1.0), 0.8);
        event.end_time = Some(100.5);
        event.status = EventStatus::Complete;
        event.sample_count = 50;
        event
    }

    #[test]
    fn test_try_submit_drops_when_full() {
        let (sink, _rx) = record_channel(2);
        assert!(sink.try_submit(temperature(1.0)));
        assert!(sink.try_submit(temperature(2.0)));
        assert!(!sink.try_submit(temperature(3.0)));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_try_submit_after_writer_gone() {
        let (sink, rx) = record_channel(2);
        drop(rx);
        assert!(!sink.try_submit(temperature(1.0)));
    }

    #[tokio::test]
    async fn test_submit_to_closed_writer_errors() {
        let (sink, rx) = record_channel(2);
        drop(rx);
        let result = sink.submit(temperature(1.0)).await;
        assert!(matches!(result, Err(RecorderError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_commits_in_order_and_drains_on_stop() {
        let (_dir, engine, sink, writer, _) = setup(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let event = event();
        sink.submit(temperature(1.0)).await.unwrap();
        sink.submit(StorageCommand::EventStarted(event.start())).await.unwrap();
        sink.submit(temperature(2.0)).await.unwrap();
        sink.submit(StorageCommand::EventCompleted(Box::new(event.clone()))).await.unwrap();
        sink.submit(temperature(3.0)).await.unwrap();

        let task = tokio::spawn(writer.run(stop_rx));
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();

        assert_eq!(stats.committed, 5);
        assert_eq!(stats.failed, 0);

        // The store was closed cleanly
        assert!(!sidecar(engine.path(), "-wal").exists());
        let (reopened, was_crash) = StorageEngine::open(engine.path()).unwrap();
        assert!(!was_crash);

        let records = reopened.unsynced_since(0, 10).unwrap();
        let kinds: Vec<&str> = records.iter().map(|r| r.payload.kind()).collect();
        assert_eq!(kinds, vec!["reading", "reading", "event", "reading"]);
        assert_eq!(reopened.event_status(&event.id).unwrap(), Some(EventStatus::Complete));
    }

    #[tokio::test]
    async fn test_writer_stops_when_sinks_dropped() {
        let (_dir, engine, sink, writer, _) = setup(8);
        let (_stop_tx, stop_rx) = watch::channel(false);

        sink.submit(temperature(1.0)).await.unwrap();
        drop(sink);

        let stats = writer.run(stop_rx).await;
        assert_eq!(stats.committed, 1);
        assert!(matches!(engine.record_count(), Err(RecorderError::StorageClosed)));
    }

    #[tokio::test]
    async fn test_commit_beats_heartbeat() {
        let (_dir, _engine, sink, writer, heartbeat) = setup(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let before = heartbeat.last();

        let task = tokio::spawn(writer.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.submit(temperature(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(heartbeat.last() > before);
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_checkpoint() {
        let (_dir, engine, sink, writer, _) = setup(8);
        let writer = writer.with_checkpoint_interval(Duration::from_millis(30));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(writer.run(stop_rx));
        sink.submit(temperature(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(std::fs::metadata(sidecar(engine.path(), "-wal")).unwrap().len(), 0);
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert!(stats.checkpoints >= 1);
    }

    #[tokio::test]
    async fn test_retention_runs_on_checkpoint_interval() {
        let (_dir, engine, sink, writer, _) = setup(8);
        let writer = writer
            .with_checkpoint_interval(Duration::from_millis(30))
            .with_retention(RetentionPolicy {
                max_age: Some(Duration::from_secs(86_400)),
                max_bytes: None,
            });
        let (stop_tx, stop_rx) = watch::channel(false);

        // Started at t=100s, long past any retention age
        let old = event();
        sink.submit(StorageCommand::EventCompleted(Box::new(old.clone()))).await.unwrap();

        let task = tokio::spawn(writer.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.event_status(&old.id).unwrap(), None);

        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.pruned, 1);

        // The summary record stays until a consumer confirms it
        let (reopened, _) = StorageEngine::open(engine.path()).unwrap();
        assert_eq!(reopened.record_count().unwrap(), 1);
    }
}
