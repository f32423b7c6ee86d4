//! # Daemon Composition
//!
//! Builds the six components by explicit construction and wires them
//! together:
//!
//! ```text
//! sensor bus -> AcquisitionLoop (own thread) -> RingBuffer
//!                    |  EventDetector inline
//!                    +-> RecordSink -> StorageWriter task -> StorageEngine
//!                    +-> event broadcast
//!                    +-> incidents -> WatchdogSupervisor task -> keepalive,
//!                                          alerts, health, reboot request
//! ```
//!
//! Start-up order is storage first (open, boot recovery within its grace
//! period, writer), then the supervisor, then acquisition. Shutdown runs
//! the other way round so the writer is the last to stop and drains
//! everything the acquisition thread queued.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acquisition::{AcquisitionExit, AcquisitionLoop, AcquisitionStats};
use crate::config::Config;
use crate::error::Result;
use crate::events::{DetectorEvent, RingBuffer};
use crate::sensor::{BusLines, SensorBus};
use crate::storage::{
    record_channel, spawn_boot_recovery, DurableRecord, Reading, RecordSink, RecoveryReport, StorageCommand,
    StorageEngine, StorageWriter, WriterStats,
};
use crate::watchdog::{
    incident_channel, Alert, HealthSnapshot, Heartbeats, Keepalive, RebootRequest, WatchdogSupervisor,
};

/// Incident queue depth; incidents are rare, a handful is plenty
const INCIDENT_CHANNEL_CAPACITY: usize = 32;

const ACQUISITION_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const WRITER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How the daemon finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// Shutdown was requested from outside
    Shutdown,
    /// The supervisor asked for a reset
    RebootRequested(RebootRequest),
}

/// A running recorder
pub struct Daemon {
    stop: watch::Sender<bool>,
    writer_stop: watch::Sender<bool>,
    acquisition: Option<thread::JoinHandle<(AcquisitionExit, AcquisitionStats)>>,
    writer: JoinHandle<WriterStats>,
    supervisor: JoinHandle<()>,
    collector: Option<JoinHandle<()>>,
    sink: RecordSink,
    engine: Arc<StorageEngine>,
    ring: Arc<RingBuffer>,
    events: broadcast::Receiver<DetectorEvent>,
    alerts: broadcast::Receiver<Alert>,
    health: watch::Receiver<HealthSnapshot>,
    reboot: watch::Receiver<Option<RebootRequest>>,
    recovery: Option<RecoveryReport>,
    sync_batch_size: usize,
}

impl Daemon {
    /// Open the store, run boot recovery and start every component.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start<B, L>(config: &Config, bus: B, lines: L, keepalive: Box<dyn Keepalive>) -> Result<Self>
    where
        B: SensorBus + 'static,
        L: BusLines + 'static,
    {
        let epoch = Instant::now();
        let heartbeats = Heartbeats::new(&config.watchdog, epoch);
        let (stop, stop_rx) = watch::channel(false);
        let (writer_stop, writer_stop_rx) = watch::channel(false);

        // Storage
        let (engine, was_crash) = StorageEngine::open(&config.storage.db_path)?;
        let engine = Arc::new(engine);
        if was_crash {
            warn!(path = %engine.path().display(), "Unclean shutdown detected");
        }
        let recovery = spawn_boot_recovery(
            engine.clone(),
            was_crash,
            Duration::from_millis(config.storage.recovery_grace_ms),
        )
        .await;

        let (sink, commands) = record_channel(config.storage.queue_capacity);
        let writer = StorageWriter::new(engine.clone(), commands, heartbeats.storage.clone(), &config.storage);
        let writer = tokio::spawn(writer.run(writer_stop_rx));

        // Supervisor
        let (reporter, incidents) = incident_channel(INCIDENT_CHANNEL_CAPACITY);
        let supervisor = WatchdogSupervisor::new(&config.watchdog, heartbeats.clone(), incidents, keepalive, epoch);
        let alerts = supervisor.subscribe_alerts();
        let health = supervisor.health();
        let reboot = supervisor.reboot_requests();
        let supervisor = tokio::spawn(supervisor.run(stop_rx.clone()));

        // Acquisition
        let ring = Arc::new(RingBuffer::new(config.buffer.window_seconds, config.sampler.sample_rate_hz));
        let acquisition = AcquisitionLoop::new(
            config,
            bus,
            lines,
            ring.clone(),
            sink.clone(),
            heartbeats,
            reporter,
        );
        let events = acquisition.subscribe_events();
        let acquisition = acquisition.spawn(stop_rx.clone())?;

        let collector = match config.storage.imu_snapshot_interval_s {
            0 => None,
            secs => Some(tokio::spawn(collect_imu_snapshots(
                ring.clone(),
                sink.clone(),
                Duration::from_secs(secs),
                stop_rx,
            ))),
        };

        info!(
            db = %engine.path().display(),
            rate_hz = config.sampler.sample_rate_hz,
            recovered = recovery.is_some(),
            "Recorder started"
        );

        Ok(Self {
            stop,
            writer_stop,
            acquisition: Some(acquisition),
            writer,
            supervisor,
            collector,
            sink,
            engine,
            ring,
            events,
            alerts,
            health,
            reboot,
            recovery,
            sync_batch_size: config.storage.sync_batch_size,
        })
    }

    /// Started and completed events
    pub fn subscribe_events(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.resubscribe()
    }

    /// Alert stream
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.resubscribe()
    }

    pub fn health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.clone()
    }

    pub fn reboot_requests(&self) -> watch::Receiver<Option<RebootRequest>> {
        self.reboot.clone()
    }

    /// Producer handle for external collectors
    pub fn sink(&self) -> RecordSink {
        self.sink.clone()
    }

    /// Store handle for sync consumers (`unsynced_since`, `advance_cursor`)
    pub fn engine(&self) -> Arc<StorageEngine> {
        self.engine.clone()
    }

    /// Next batch of records `consumer` has not yet acknowledged.
    ///
    /// Call [`StorageEngine::advance_cursor`] with the last id once the
    /// batch has been delivered; until then the same batch is returned.
    pub fn unsynced_batch(&self, consumer: &str) -> Result<Vec<DurableRecord>> {
        let cursor = self.engine.cursor(consumer)?;
        self.engine.unsynced_since(cursor, self.sync_batch_size)
    }

    /// Latest-sample snapshot source
    pub fn ring(&self) -> Arc<RingBuffer> {
        self.ring.clone()
    }

    /// Boot recovery outcome, if it finished within its grace period
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Wait for `shutdown` or a reboot request, whichever comes first
    pub async fn wait<F>(&mut self, shutdown: F) -> DaemonExit
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut reboot = self.reboot.clone();

        loop {
            if let Some(request) = *reboot.borrow_and_update() {
                return DaemonExit::RebootRequested(request);
            }
            tokio::select! {
                _ = &mut shutdown => return DaemonExit::Shutdown,
                changed = reboot.changed() => {
                    if changed.is_err() {
                        // Supervisor gone: nothing left to watch but shutdown
                        shutdown.as_mut().await;
                        return DaemonExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Stop every component and close the store.
    ///
    /// Acquisition stops first, then the supervisor and the collector, and
    /// finally the writer, which drains its queue before closing.
    pub async fn shutdown(mut self) -> Option<WriterStats> {
        info!("Shutting down recorder");
        let _ = self.stop.send(true);

        if let Some(handle) = self.acquisition.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(ACQUISITION_JOIN_TIMEOUT, joined).await {
                Ok(Ok(Ok((exit, stats)))) => debug!(?exit, samples = stats.samples_total, "Acquisition joined"),
                Ok(Ok(Err(_))) => error!("Acquisition thread panicked"),
                Ok(Err(e)) => error!(error = %e, "Acquisition join task failed"),
                Err(_) => warn!("Acquisition thread did not stop in time"),
            }
        }

        if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut self.supervisor).await.is_err() {
            warn!("Supervisor did not stop in time");
            self.supervisor.abort();
        }
        if let Some(mut collector) = self.collector.take() {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut collector).await.is_err() {
                collector.abort();
            }
        }

        let _ = self.writer_stop.send(true);
        drop(self.sink);
        match tokio::time::timeout(WRITER_JOIN_TIMEOUT, self.writer).await {
            Ok(Ok(stats)) => Some(stats),
            Ok(Err(e)) => {
                error!(error = %e, "Storage writer task failed");
                None
            }
            Err(_) => {
                error!("Storage writer did not finish draining in time");
                None
            }
        }
    }
}

/// Submit the latest sample as a low-rate IMU reading every `every`.
///
/// A sample already submitted is not submitted again, so a stalled
/// sampler does not fill the store with copies.
async fn collect_imu_snapshots(
    ring: Arc<RingBuffer>,
    sink: RecordSink,
    every: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_timestamp = None;

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let Some(sample) = ring.latest() else {
                    continue;
                };
                if last_timestamp == Some(sample.timestamp) {
                    continue;
                }
                last_timestamp = Some(sample.timestamp);
                if let Err(e) = sink.submit(StorageCommand::Reading(Reading::imu(&sample))).await {
                    warn!(error = %e, "IMU snapshot collector stopping");
                    break;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("IMU snapshot collector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::bus_trait::mocks::mock_pair;
    use crate::storage::engine::sidecar;
    use crate::storage::RecordPayload;
    use crate::watchdog::{AlertCategory, NoKeepalive};
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage.db_path = dir.join("telemetry.db").to_string_lossy().into_owned();
        config.bus_recovery.settle_ms = 0;
        config.watchdog.keepalive = "none".to_string();
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_clean_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let (bus, lines) = mock_pair();

        let daemon = Daemon::start(&config, bus, lines, Box::new(NoKeepalive)).await.unwrap();
        assert_eq!(daemon.recovery_report().map(|r| r.was_crash), Some(false));
        let engine = daemon.engine();
        let ring = daemon.ring();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!ring.is_empty());

        let stats = daemon.shutdown().await.unwrap();
        assert!(stats.committed >= 1);

        // Clean close removes the write-ahead log
        assert!(!sidecar(Path::new(&config.storage.db_path), "-wal").exists());

        let (reopened, was_crash) = StorageEngine::open(&config.storage.db_path).unwrap();
        assert!(!was_crash);
        let records = reopened.unsynced_since(0, 100).unwrap();
        assert!(records
            .iter()
            .all(|r| matches!(r.payload, RecordPayload::Reading(_))));
        drop(engine);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unsynced_batch_follows_cursor() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.storage.sync_batch_size = 2;
        config.storage.imu_snapshot_interval_s = 0;
        let (bus, lines) = mock_pair();

        let daemon = Daemon::start(&config, bus, lines, Box::new(NoKeepalive)).await.unwrap();
        let sink = daemon.sink();
        for celsius in [40.0, 41.0, 42.0] {
            sink.submit(StorageCommand::Reading(Reading::temperature(chrono::Utc::now(), celsius)))
                .await
                .unwrap();
        }
        let engine = daemon.engine();
        for _ in 0..50 {
            if engine.record_count().unwrap() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let first = daemon.unsynced_batch("uplink").unwrap();
        assert_eq!(first.len(), 2);
        // Unacknowledged batches are handed out again
        assert_eq!(daemon.unsynced_batch("uplink").unwrap(), first);

        engine.advance_cursor("uplink", first[1].id).unwrap();
        let rest = daemon.unsynced_batch("uplink").unwrap();
        assert_eq!(rest.len(), 1);
        assert!(rest[0].id > first[1].id);

        daemon.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrecoverable_bus_requests_reboot() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let (bus, lines) = mock_pair();
        bus.push_failures(5);
        bus.set_fail_reopen(true);

        let mut daemon = Daemon::start(&config, bus, lines, Box::new(NoKeepalive)).await.unwrap();
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            daemon.wait(std::future::pending()),
        )
        .await
        .unwrap();

        assert_eq!(
            exit,
            DaemonExit::RebootRequested(RebootRequest {
                cause: AlertCategory::BusRecoveryFailed
            })
        );
        assert!(daemon.shutdown().await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_future_ends_wait() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let (bus, lines) = mock_pair();

        let mut daemon = Daemon::start(&config, bus, lines, Box::new(NoKeepalive)).await.unwrap();
        let exit = daemon.wait(tokio::time::sleep(Duration::from_millis(50))).await;
        assert_eq!(exit, DaemonExit::Shutdown);
        assert!(daemon.shutdown().await.is_some());
    }
}
