//! Incidents, alerts and escalation tracking.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

use super::heartbeat::Component;

/// Fault reported from the acquisition thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incident {
    /// Consecutive read failures reached the recovery threshold
    BusLockup { consecutive_failures: u32 },
    /// The recovery sequence brought the bus back
    BusRecovered,
    /// The recovery sequence failed; acquisition has stopped
    BusRecoveryFailed,
}

/// What an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "category", content = "component", rename_all = "snake_case")]
pub enum AlertCategory {
    Stalled(#[serde(serialize_with = "component_name")] Component),
    Dead(#[serde(serialize_with = "component_name")] Component),
    BusLockup,
    BusRecoveryFailed,
}

fn component_name<S: serde::Serializer>(component: &Component, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(component.as_str())
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertCategory::Stalled(c) => write!(f, "{} stalled", c),
            AlertCategory::Dead(c) => write!(f, "{} dead", c),
            AlertCategory::BusLockup => f.write_str("bus lockup"),
            AlertCategory::BusRecoveryFailed => f.write_str("bus recovery failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Normal,
    Escalated,
}

/// One dispatched alert.
///
/// Rendering (tones, display, notifications) belongs to whoever
/// subscribes to the alert stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub category: AlertCategory,
    pub severity: Severity,
    pub intensity: Intensity,
    pub is_recovery: bool,
}

impl Alert {
    pub fn recovery(category: AlertCategory) -> Self {
        Self {
            category,
            severity: Severity::Info,
            intensity: Intensity::Normal,
            is_recovery: true,
        }
    }
}

/// Last-alert time per category.
///
/// A category alerted again within the window is escalated.
#[derive(Debug)]
pub struct AlertEscalation {
    window: Duration,
    last_alert: HashMap<AlertCategory, Instant>,
}

impl AlertEscalation {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_alert: HashMap::new(),
        }
    }

    /// Record an alert of `category` at `now` and return its intensity
    pub fn record(&mut self, category: AlertCategory, now: Instant) -> Intensity {
        let intensity = match self.last_alert.get(&category) {
            Some(last) if now.saturating_duration_since(*last) < self.window => Intensity::Escalated,
            _ => Intensity::Normal,
        };
        self.last_alert.insert(category, now);
        intensity
    }

    /// Forget the history of `category`
    pub fn reset(&mut self, category: AlertCategory) {
        self.last_alert.remove(&category);
    }

    pub fn last_alert(&self, category: AlertCategory) -> Option<Instant> {
        self.last_alert.get(&category).copied()
    }
}

/// Non-blocking incident sender used from the acquisition thread
#[derive(Debug, Clone)]
pub struct IncidentReporter {
    tx: mpsc::Sender<Incident>,
    dropped: Arc<AtomicU64>,
}

impl IncidentReporter {
    pub fn new(tx: mpsc::Sender<Incident>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an incident without blocking; a full queue drops it
    pub fn report(&self, incident: Incident) -> bool {
        match self.tx.try_send(incident) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(?incident, error = %e, "Incident not delivered to supervisor");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Incident queue between the acquisition thread and the supervisor
pub fn incident_channel(capacity: usize) -> (IncidentReporter, mpsc::Receiver<Incident>) {
    let (tx, rx) = mpsc::channel(capacity);
    (IncidentReporter::new(tx), rx)
}
