//! Event records and their identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::sensor::Sample;

/// Kinds of detectable driving events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Strong longitudinal deceleration
    HardBrake,
    /// Strong lateral acceleration
    BigCorner,
    /// Strong combined horizontal acceleration
    HighG,
    /// High vertical vibration
    RoughRoad,
}

impl EventType {
    /// Every type, in evaluation order
    pub const ALL: [EventType; 4] = [
        EventType::HardBrake,
        EventType::BigCorner,
        EventType::HighG,
        EventType::RoughRoad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HardBrake => "hard_brake",
            EventType::BigCorner => "big_corner",
            EventType::HighG => "high_g",
            EventType::RoughRoad => "rough_road",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Stable event identity, assigned once when the excursion starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle marker persisted with every event row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Excursion still in progress
    Active,
    /// Ended normally (dwell satisfied)
    Complete,
    /// Closed by boot recovery after an uncontrolled stop
    Interrupted,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Complete => "complete",
            EventStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EventStatus::Active),
            "complete" => Ok(EventStatus::Complete),
            "interrupted" => Ok(EventStatus::Interrupted),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// Observed extremes of one axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    fn new(value: f64) -> Self {
        Self { min: value, max: value }
    }

    #[inline]
    fn update(&mut self, value: f64) {
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }
}

/// Peak tracking for an event, updated incrementally per sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peaks {
    /// Largest derived metric value seen
    pub value: f64,
    /// Axes of the sample that produced `value`
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub ax_range: AxisRange,
    pub ay_range: AxisRange,
    pub az_range: AxisRange,
}

impl Peaks {
    pub fn new(sample: &Sample, metric: f64) -> Self {
        Self {
            value: metric,
            ax: sample.ax,
            ay: sample.ay,
            az: sample.az,
            ax_range: AxisRange::new(sample.ax),
            ay_range: AxisRange::new(sample.ay),
            az_range: AxisRange::new(sample.az),
        }
    }

    pub fn update(&mut self, sample: &Sample, metric: f64) {
        if metric > self.value {
            self.value = metric;
            self.ax = sample.ax;
            self.ay = sample.ay;
            self.az = sample.az;
        }
        self.ax_range.update(sample.ax);
        self.ay_range.update(sample.ay);
        self.az_range.update(sample.az);
    }
}

/// Notice that an excursion has lasted long enough to be a real event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventStart {
    pub id: EventId,
    pub event_type: EventType,
    pub start_time: f64,
}

/// One detected excursion of a monitored signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: EventType,
    pub status: EventStatus,
    /// Unix seconds of the first sample at or above threshold
    pub start_time: f64,
    /// Unix seconds the metric returned below threshold; unset while active
    pub end_time: Option<f64>,
    pub peaks: Peaks,
    /// Captured samples (pre-event context first), capped
    pub samples: Vec<Sample>,
    /// Samples observed while active, including those past the cap
    pub sample_count: u64,
}

impl Event {
    /// Start a new active event at `sample`
    pub fn begin(event_type: EventType, sample: &Sample, metric: f64) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            status: EventStatus::Active,
            start_time: sample.timestamp,
            end_time: None,
            peaks: Peaks::new(sample, metric),
            samples: Vec::new(),
            sample_count: 0,
        }
    }

    /// Event duration in seconds, once ended
    pub fn duration(&self) -> Option<f64> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn start(&self) -> EventStart {
        EventStart {
            id: self.id,
            event_type: self.event_type,
            start_time: self.start_time,
        }
    }

    /// Sample-free view used for sync records
    pub fn summary(&self) -> EventSummary {
        EventSummary {
            id: self.id,
            event_type: self.event_type,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms: self.duration().map(|d| (d * 1000.0).round() as i64),
            peak_value: self.peaks.value,
            peak_ax: self.peaks.ax,
            peak_ay: self.peaks.ay,
            peak_az: self.peaks.az,
            sample_count: self.sample_count,
        }
    }
}

/// Compact event description carried in durable records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: EventId,
    pub event_type: EventType,
    pub status: EventStatus,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub duration_ms: Option<i64>,
    pub peak_value: f64,
    pub peak_ax: f64,
    pub peak_ay: f64,
    pub peak_az: f64,
    pub sample_count: u64,
}
