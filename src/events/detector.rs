//! # Event Detector
//!
//! Threshold state machine run inline on the acquisition thread.
//!
//! Every event type moves independently through `Idle -> Active -> Idle`:
//!
//! - **Idle -> Active**: the type's metric reaches its threshold and the
//!   type is not cooling down. The event is seeded with pre-event context
//!   from the ring buffer.
//! - **Active**: every sample is captured (up to the cap) and peaks are
//!   updated. Once the excursion has lasted the minimum duration a
//!   [`DetectorEvent::Started`] notice is emitted, once per event.
//! - **Active -> Idle**: the metric has stayed below threshold for the
//!   dwell time. A renewed crossing restarts the dwell. Excursions shorter
//!   than the minimum duration are dropped without a cooldown stamp; all
//!   others are emitted as [`DetectorEvent::Completed`] and start the
//!   cooldown.
//!
//! Time is always the sample clock, never the wall clock.

use std::sync::Arc;
use tracing::{debug, info};

use super::metrics::{self, RollingStdDev};
use super::ring_buffer::RingBuffer;
use super::types::{Event, EventStart, EventStatus, EventType};
use crate::config::{DetectorConfig, TriggerConfig};
use crate::sensor::Sample;

/// Output of one detector step
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// An excursion has lasted long enough to be kept
    Started(EventStart),
    /// An event ended normally
    Completed(Event),
}

/// Per-type detection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub started: u64,
    pub completed: u64,
    /// Excursions shorter than the minimum duration
    pub discarded: u64,
    /// Threshold crossings ignored during cooldown
    pub suppressed: u64,
}

struct Trigger {
    threshold: f64,
    dwell: f64,
    min_duration: f64,
}

impl From<&TriggerConfig> for Trigger {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            threshold: config.threshold,
            dwell: config.dwell_ms as f64 / 1000.0,
            min_duration: config.min_duration_ms as f64 / 1000.0,
        }
    }
}

struct ActiveEvent {
    event: Event,
    /// Timestamp of the first sample of the current below-threshold run
    below_since: Option<f64>,
    announced: bool,
}

enum Phase {
    Idle,
    Active(Box<ActiveEvent>),
}

struct TypeState {
    event_type: EventType,
    trigger: Trigger,
    phase: Phase,
    last_completed: Option<f64>,
    /// Previous sample was a suppressed crossing
    suppressing: bool,
    stats: TypeStats,
}

/// Multi-signal event detector
pub struct EventDetector {
    states: Vec<TypeState>,
    rough_road: RollingStdDev,
    ring: Arc<RingBuffer>,
    cooldown: f64,
    pre_event: f64,
    max_samples: usize,
}

impl EventDetector {
    pub fn new(config: &DetectorConfig, sample_rate_hz: u32, ring: Arc<RingBuffer>) -> Self {
        let states = EventType::ALL
            .into_iter()
            .map(|event_type| {
                let trigger = match event_type {
                    EventType::HardBrake => &config.hard_brake,
                    EventType::BigCorner => &config.big_corner,
                    EventType::HighG => &config.high_g,
                    EventType::RoughRoad => &config.rough_road,
                };
                TypeState {
                    event_type,
                    trigger: trigger.into(),
                    phase: Phase::Idle,
                    last_completed: None,
                    suppressing: false,
                    stats: TypeStats::default(),
                }
            })
            .collect();

        Self {
            states,
            rough_road: RollingStdDev::for_window(config.rough_road_window_ms, sample_rate_hz),
            ring,
            cooldown: config.cooldown_seconds,
            pre_event: config.pre_event_seconds,
            max_samples: config.max_event_samples.max(1),
        }
    }

    /// Feed one sample. The sample must already be in the ring buffer.
    pub fn process(&mut self, sample: &Sample) -> Vec<DetectorEvent> {
        let rough = self.rough_road.push(sample.az);
        let mut out = Vec::new();

        for index in 0..self.states.len() {
            let event_type = self.states[index].event_type;
            let metric = match event_type {
                EventType::RoughRoad => rough,
                other => metrics::instantaneous(other, sample),
            };
            // RoughRoad has no value until its window has filled
            if let Some(metric) = metric {
                self.step(index, sample, metric, &mut out);
            }
        }

        out
    }

    fn step(&mut self, index: usize, sample: &Sample, metric: f64, out: &mut Vec<DetectorEvent>) {
        let ts = sample.timestamp;
        let above = metric >= self.states[index].trigger.threshold;

        if matches!(self.states[index].phase, Phase::Idle) {
            if above {
                self.activate(index, sample, metric, out);
            } else {
                self.states[index].suppressing = false;
            }
            return;
        }

        let max_samples = self.max_samples;
        let state = &mut self.states[index];
        let Phase::Active(active) = &mut state.phase else {
            return;
        };

        active.event.sample_count += 1;
        if active.event.samples.len() < max_samples {
            active.event.samples.push(*sample);
        }
        active.event.peaks.update(sample, metric);

        if above {
            active.below_since = None;
            Self::announce(state, ts, out);
            return;
        }

        let below_since = *active.below_since.get_or_insert(ts);
        if ts - below_since < state.trigger.dwell {
            return;
        }

        let Phase::Active(mut active) = std::mem::replace(&mut state.phase, Phase::Idle) else {
            return;
        };
        let duration = below_since - active.event.start_time;

        if duration < state.trigger.min_duration {
            state.stats.discarded += 1;
            debug!(
                event_type = %state.event_type,
                duration_ms = (duration * 1000.0).round() as i64,
                "Discarding short excursion"
            );
            return;
        }

        active.event.end_time = Some(below_since);
        active.event.status = EventStatus::Complete;
        state.last_completed = Some(ts);
        state.stats.completed += 1;

        info!(
            event_id = %active.event.id,
            event_type = %state.event_type,
            duration_ms = (duration * 1000.0).round() as i64,
            peak = active.event.peaks.value,
            samples = active.event.sample_count,
            "Event completed"
        );
        out.push(DetectorEvent::Completed(active.event));
    }

    fn activate(&mut self, index: usize, sample: &Sample, metric: f64, out: &mut Vec<DetectorEvent>) {
        let ts = sample.timestamp;
        let state = &mut self.states[index];

        if let Some(last) = state.last_completed {
            if ts - last < self.cooldown {
                if !state.suppressing {
                    state.suppressing = true;
                    state.stats.suppressed += 1;
                    debug!(event_type = %state.event_type, "Crossing ignored during cooldown");
                }
                return;
            }
        }
        state.suppressing = false;

        let mut event = Event::begin(state.event_type, sample, metric);

        // Pre-event context, leaving room for at least the triggering sample
        let history: Vec<Sample> = self
            .ring
            .window(self.pre_event)
            .into_iter()
            .filter(|s| s.timestamp < ts)
            .collect();
        let keep = history.len().min(self.max_samples - 1);
        event.samples.reserve(keep + 1);
        event.samples.extend_from_slice(&history[history.len() - keep..]);
        event.samples.push(*sample);
        event.sample_count = 1;

        debug!(event_id = %event.id, event_type = %state.event_type, metric, "Threshold crossed");

        state.phase = Phase::Active(Box::new(ActiveEvent {
            event,
            below_since: None,
            announced: false,
        }));
        Self::announce(state, ts, out);
    }

    fn announce(state: &mut TypeState, ts: f64, out: &mut Vec<DetectorEvent>) {
        let Phase::Active(active) = &mut state.phase else {
            return;
        };
        if active.announced || ts - active.event.start_time < state.trigger.min_duration {
            return;
        }

        active.announced = true;
        state.stats.started += 1;
        info!(
            event_id = %active.event.id,
            event_type = %state.event_type,
            "Event started"
        );
        out.push(DetectorEvent::Started(active.event.start()));
    }

    /// Whether an event of `event_type` is currently active
    pub fn is_active(&self, event_type: EventType) -> bool {
        self.state(event_type)
            .map(|s| matches!(s.phase, Phase::Active(_)))
            .unwrap_or(false)
    }

    /// Detection counters for one type
    pub fn stats(&self, event_type: EventType) -> TypeStats {
        self.state(event_type).map(|s| s.stats).unwrap_or_default()
    }

    fn state(&self, event_type: EventType) -> Option<&TypeState> {
        self.states.iter().find(|s| s.event_type == event_type)
    }
}
