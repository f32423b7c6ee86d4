//! # Acquisition Loop
//!
//! Fixed-rate sampling on a dedicated OS thread.
//!
//! Each tick reads one sample with a bounded timeout, pushes it into the
//! ring buffer, runs the event detector inline and hands detector output to
//! the storage writer and the event broadcast. Nothing on this thread ever
//! waits on the async runtime: storage submissions and incident reports are
//! `try_send`, and a full queue drops instead of blocking.
//!
//! A failed read never produces a sample. After `failure_threshold`
//! consecutive failures the bus recovery sequence runs synchronously before
//! the next read. If recovery fails the loop reports a fatal incident and
//! exits.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::events::{DetectorEvent, EventDetector, RingBuffer};
use crate::sensor::{BusLines, BusRecoveryController, SensorBus};
use crate::storage::{RecordSink, StorageCommand};
use crate::watchdog::{Heartbeats, Incident, IncidentReporter};

/// Capacity of the detector event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Samples between periodic status lines (one minute at 100Hz)
const STATS_LOG_INTERVAL_SAMPLES: u64 = 6000;

/// Why the loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionExit {
    /// Stop was requested
    Stopped,
    /// The bus could not be recovered
    BusFault,
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sampled,
    ReadFailed,
    Recovered,
    BusFault,
}

/// Sampler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub samples_total: u64,
    pub read_failures: u64,
    pub overruns: u64,
    pub recoveries: u64,
    pub events_started: u64,
    pub events_completed: u64,
}

/// The sampling thread's state
pub struct AcquisitionLoop<B: SensorBus, L: BusLines> {
    bus: B,
    recovery: BusRecoveryController<L>,
    ring: Arc<RingBuffer>,
    detector: EventDetector,
    sink: RecordSink,
    events: broadcast::Sender<DetectorEvent>,
    heartbeats: Heartbeats,
    incidents: IncidentReporter,
    period: Duration,
    read_timeout: Duration,
    failure_threshold: u32,
    consecutive_failures: u32,
    stats: AcquisitionStats,
}

impl<B: SensorBus, L: BusLines> AcquisitionLoop<B, L> {
    pub fn new(
        config: &Config,
        bus: B,
        lines: L,
        ring: Arc<RingBuffer>,
        sink: RecordSink,
        heartbeats: Heartbeats,
        incidents: IncidentReporter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let detector = EventDetector::new(&config.detector, config.sampler.sample_rate_hz, ring.clone());

        Self {
            bus,
            recovery: BusRecoveryController::new(lines, &config.bus_recovery),
            ring,
            detector,
            sink,
            events,
            heartbeats,
            incidents,
            period: config.sampler.tick_period(),
            read_timeout: config.sampler.read_timeout(),
            failure_threshold: config.sampler.failure_threshold,
            consecutive_failures: 0,
            stats: AcquisitionStats::default(),
        }
    }

    /// Started and completed events as they are detected
    pub fn subscribe_events(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Read, buffer and detect once
    pub fn tick(&mut self) -> TickOutcome {
        let sample = match self.bus.read_sample(self.read_timeout) {
            Ok(sample) => sample,
            Err(e) => return self.on_read_failure(e),
        };

        self.consecutive_failures = 0;
        self.stats.samples_total += 1;
        self.ring.push(sample);
        self.heartbeats.acquisition.beat();

        let output = self.detector.process(&sample);
        self.heartbeats.detector.beat();
        for event in output {
            self.dispatch(event);
        }

        if self.stats.samples_total % STATS_LOG_INTERVAL_SAMPLES == 0 {
            info!(
                samples = self.stats.samples_total,
                failures = self.stats.read_failures,
                overruns = self.stats.overruns,
                recoveries = self.stats.recoveries,
                "Acquisition status"
            );
        }

        TickOutcome::Sampled
    }

    fn on_read_failure(&mut self, e: crate::error::RecorderError) -> TickOutcome {
        self.consecutive_failures += 1;
        self.stats.read_failures += 1;

        if self.consecutive_failures == 1 {
            warn!(error = %e, "IMU read failed");
        } else {
            debug!(error = %e, consecutive = self.consecutive_failures, "IMU read failed");
        }

        if self.consecutive_failures < self.failure_threshold {
            return TickOutcome::ReadFailed;
        }

        warn!(
            consecutive_failures = self.consecutive_failures,
            "I2C bus lockup suspected, attempting recovery"
        );
        self.incidents.report(Incident::BusLockup {
            consecutive_failures: self.consecutive_failures,
        });

        if self.recovery.recover(&mut self.bus) {
            self.consecutive_failures = 0;
            self.stats.recoveries += 1;
            self.incidents.report(Incident::BusRecovered);
            TickOutcome::Recovered
        } else {
            error!(attempts = self.recovery.attempts(), "I2C bus recovery failed, acquisition stopping");
            self.heartbeats.acquisition.mark_fatal();
            self.incidents.report(Incident::BusRecoveryFailed);
            TickOutcome::BusFault
        }
    }

    fn dispatch(&mut self, event: DetectorEvent) {
        match &event {
            DetectorEvent::Started(start) => {
                self.stats.events_started += 1;
                info!(event_id = %start.id, event_type = %start.event_type, "Event started");
                self.sink.try_submit(StorageCommand::EventStarted(start.clone()));
            }
            DetectorEvent::Completed(completed) => {
                self.stats.events_completed += 1;
                info!(
                    event_id = %completed.id,
                    event_type = %completed.event_type,
                    peak = completed.peaks.value,
                    duration_s = completed.duration().unwrap_or_default(),
                    "Event completed"
                );
                self.sink
                    .try_submit(StorageCommand::EventCompleted(Box::new(completed.clone())));
            }
        }
        // Nobody listening is normal
        let _ = self.events.send(event);
    }

    /// Tick at the configured rate until `stop` flips or the bus faults.
    ///
    /// Keeps an absolute deadline clock. Falling more than one period
    /// behind counts an overrun and re-anchors the clock instead of
    /// bursting to catch up.
    pub fn run(&mut self, stop: watch::Receiver<bool>) -> AcquisitionExit {
        info!(
            period_us = self.period.as_micros() as u64,
            read_timeout_ms = self.read_timeout.as_millis() as u64,
            "Acquisition loop started"
        );

        let mut deadline = Instant::now();
        let exit = loop {
            // A dropped stop sender also means stop
            if *stop.borrow() || stop.has_changed().is_err() {
                break AcquisitionExit::Stopped;
            }

            if self.tick() == TickOutcome::BusFault {
                break AcquisitionExit::BusFault;
            }

            deadline += self.period;
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            } else if now - deadline > self.period {
                self.stats.overruns += 1;
                debug!(behind_us = (now - deadline).as_micros() as u64, "Acquisition overrun");
                deadline = now;
            }
        };

        info!(
            ?exit,
            samples = self.stats.samples_total,
            failures = self.stats.read_failures,
            overruns = self.stats.overruns,
            recoveries = self.stats.recoveries,
            events_started = self.stats.events_started,
            events_completed = self.stats.events_completed,
            dropped_records = self.sink.dropped(),
            "Acquisition loop stopped"
        );
        exit
    }
}

impl<B, L> AcquisitionLoop<B, L>
where
    B: SensorBus + 'static,
    L: BusLines + 'static,
{
    /// Run on a dedicated named thread
    pub fn spawn(
        mut self,
        stop: watch::Receiver<bool>,
    ) -> Result<thread::JoinHandle<(AcquisitionExit, AcquisitionStats)>> {
        let handle = thread::Builder::new().name("acquisition".to_string()).spawn(move || {
            let exit = self.run(stop);
            (exit, self.stats)
        })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::sensor::bus_trait::mocks::{mock_pair, BusOp, MockBus, MockLines};
    use crate::sensor::Sample;
    use crate::storage::record_channel;
    use crate::watchdog::{incident_channel, ComponentState};
    use tokio::sync::mpsc;

    struct Harness {
        looper: AcquisitionLoop<MockBus, MockLines>,
        bus: MockBus,
        ring: Arc<RingBuffer>,
        commands: mpsc::Receiver<StorageCommand>,
        incidents: mpsc::Receiver<Incident>,
        heartbeats: Heartbeats,
    }

    fn harness() -> Harness {
        let mut config = Config::default();
        config.bus_recovery.settle_ms = 0;

        let (bus, lines) = mock_pair();
        let ring = Arc::new(RingBuffer::new(config.buffer.window_seconds, config.sampler.sample_rate_hz));
        let (sink, commands) = record_channel(256);
        let (reporter, incidents) = incident_channel(16);
        let heartbeats = Heartbeats::new(&config.watchdog, Instant::now());

        let looper = AcquisitionLoop::new(
            &config,
            bus.clone(),
            lines,
            ring.clone(),
            sink,
            heartbeats.clone(),
            reporter,
        );
        Harness {
            looper,
            bus,
            ring,
            commands,
            incidents,
            heartbeats,
        }
    }

    fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_five_failures_then_exactly_one_recovery_before_sixth_read() {
        let mut h = harness();
        h.bus.push_failures(5);

        let outcomes: Vec<_> = (0..6).map(|_| h.looper.tick()).collect();
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::ReadFailed,
                TickOutcome::ReadFailed,
                TickOutcome::ReadFailed,
                TickOutcome::ReadFailed,
                TickOutcome::Recovered,
                TickOutcome::Sampled,
            ]
        );

        let ops = h.bus.ops();
        let reads: Vec<usize> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| **op == BusOp::Read)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(reads.len(), 6);
        let between = &ops[reads[4]..reads[5]];
        assert_eq!(between.iter().filter(|op| **op == BusOp::Release).count(), 1);
        assert_eq!(between.iter().filter(|op| **op == BusOp::Reopen).count(), 1);
        assert_eq!(between.iter().filter(|op| **op == BusOp::Initialize).count(), 1);
        assert_eq!(h.bus.count(BusOp::Release), 1);

        let stats = h.looper.stats();
        assert_eq!(stats.read_failures, 5);
        assert_eq!(stats.recoveries, 1);
        assert_eq!(stats.samples_total, 1);
        assert_eq!(h.looper.consecutive_failures(), 0);

        assert_eq!(
            drain(&mut h.incidents),
            vec![Incident::BusLockup { consecutive_failures: 5 }, Incident::BusRecovered]
        );
    }

    #[test]
    fn test_failed_reads_never_reach_ring() {
        let mut h = harness();
        h.bus.push_failures(3);

        for _ in 0..3 {
            assert_eq!(h.looper.tick(), TickOutcome::ReadFailed);
        }
        assert!(h.ring.is_empty());
        assert!(drain(&mut h.incidents).is_empty());

        assert_eq!(h.looper.tick(), TickOutcome::Sampled);
        assert_eq!(h.ring.len(), 1);
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let mut h = harness();
        h.bus.push_failures(4);
        h.bus.push_sample(Sample::accel(500.0, 0.0, 0.0, 1.0));
        h.bus.push_failures(4);

        for _ in 0..9 {
            assert_ne!(h.looper.tick(), TickOutcome::Recovered);
        }
        assert_eq!(h.looper.stats().recoveries, 0);
        assert_eq!(h.looper.consecutive_failures(), 4);
    }

    #[test]
    fn test_recovery_failure_is_fatal() {
        let mut h = harness();
        h.bus.push_failures(5);
        h.bus.set_fail_reopen(true);

        let outcomes: Vec<_> = (0..5).map(|_| h.looper.tick()).collect();
        assert_eq!(outcomes.last(), Some(&TickOutcome::BusFault));
        assert!(h.heartbeats.acquisition.is_fatal());
        assert_eq!(
            h.heartbeats.acquisition.state_at(Instant::now()),
            ComponentState::Dead
        );
        assert_eq!(
            drain(&mut h.incidents),
            vec![
                Incident::BusLockup { consecutive_failures: 5 },
                Incident::BusRecoveryFailed
            ]
        );
    }

    #[test]
    fn test_run_exits_on_bus_fault() {
        let mut h = harness();
        h.bus.push_failures(5);
        h.bus.set_fail_initialize(true);
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert_eq!(h.looper.run(stop_rx), AcquisitionExit::BusFault);
    }

    #[test]
    fn test_run_honours_stop() {
        let mut h = harness();
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        assert_eq!(h.looper.run(stop_rx), AcquisitionExit::Stopped);
        assert_eq!(h.looper.stats().samples_total, 0);
    }

    #[test]
    fn test_spawned_thread_stops_when_sender_dropped() {
        let h = harness();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = h.looper.spawn(stop_rx).unwrap();

        thread::sleep(Duration::from_millis(50));
        drop(stop_tx);

        let (exit, stats) = handle.join().unwrap();
        assert_eq!(exit, AcquisitionExit::Stopped);
        assert!(stats.samples_total > 0);
    }

    #[test]
    fn test_detected_event_reaches_storage_and_broadcast() {
        let mut h = harness();
        let mut events = h.looper.subscribe_events();
        let mut ts = 2000.0;
        let mut push = |count: usize, ax: f64| {
            for _ in 0..count {
                h.bus.push_sample(Sample::accel(ts, ax, 0.0, 1.0));
                ts += 0.01;
            }
        };
        push(50, 0.0);
        push(30, -0.6);
        push(50, 0.0);

        for _ in 0..130 {
            assert_eq!(h.looper.tick(), TickOutcome::Sampled);
        }

        let commands = drain(&mut h.commands);
        assert_eq!(commands.len(), 2);
        let started = match &commands[0] {
            StorageCommand::EventStarted(start) => start.clone(),
            other => panic!("unexpected command {:?}", other),
        };
        match &commands[1] {
            StorageCommand::EventCompleted(event) => {
                assert_eq!(event.id, started.id);
                assert_eq!(event.event_type, EventType::HardBrake);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(matches!(events.try_recv(), Ok(DetectorEvent::Started(_))));
        assert!(matches!(events.try_recv(), Ok(DetectorEvent::Completed(_))));

        let stats = h.looper.stats();
        assert_eq!(stats.events_started, 1);
        assert_eq!(stats.events_completed, 1);
        assert_eq!(h.ring.len(), 130);
    }
}
