//! Liveness heartbeats.
//!
//! Each supervised component owns an `Arc<Heartbeat>` and beats it after
//! every successful unit of work. The supervisor only ever reads them.
//! Times are milliseconds since a shared epoch, held in atomics so the
//! acquisition thread never takes a lock to report progress.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::WatchdogConfig;

/// Supervised components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Acquisition,
    Detector,
    Storage,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Acquisition, Component::Detector, Component::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Acquisition => "acquisition",
            Component::Detector => "detector",
            Component::Storage => "storage",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one component as judged from its heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentState {
    Healthy,
    Stale,
    Dead,
}

/// "Last known good" time of one component
#[derive(Debug)]
pub struct Heartbeat {
    component: Component,
    epoch: Instant,
    last_ms: AtomicU64,
    fatal: AtomicBool,
    stale_after: Duration,
    dead_after: Duration,
}

impl Heartbeat {
    /// A heartbeat that last beat at `epoch`
    pub fn new(component: Component, epoch: Instant, stale_after: Duration, dead_after: Duration) -> Self {
        Self {
            component,
            epoch,
            last_ms: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            stale_after,
            dead_after,
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn beat(&self) {
        self.beat_at(Instant::now());
    }

    /// Record progress at `at`. Never moves the heartbeat backward.
    pub fn beat_at(&self, at: Instant) {
        let ms = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_ms.fetch_max(ms, Ordering::Release);
    }

    /// Last beat as an instant
    pub fn last(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    /// The component has stopped for good; it reports Dead from now on
    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last())
    }

    pub fn state_at(&self, now: Instant) -> ComponentState {
        if self.is_fatal() {
            return ComponentState::Dead;
        }
        let age = self.age_at(now);
        if age >= self.dead_after {
            ComponentState::Dead
        } else if age >= self.stale_after {
            ComponentState::Stale
        } else {
            ComponentState::Healthy
        }
    }
}

/// The full set of supervised heartbeats
#[derive(Debug, Clone)]
pub struct Heartbeats {
    pub acquisition: Arc<Heartbeat>,
    pub detector: Arc<Heartbeat>,
    pub storage: Arc<Heartbeat>,
}

impl Heartbeats {
    pub fn new(config: &WatchdogConfig, epoch: Instant) -> Self {
        let make = |component, stale_ms, dead_ms| {
            Arc::new(Heartbeat::new(
                component,
                epoch,
                Duration::from_millis(stale_ms),
                Duration::from_millis(dead_ms),
            ))
        };
        Self {
            acquisition: make(Component::Acquisition, config.acquisition_stale_ms, config.acquisition_dead_ms),
            detector: make(Component::Detector, config.detector_stale_ms, config.detector_dead_ms),
            storage: make(Component::Storage, config.storage_stale_ms, config.storage_dead_ms),
        }
    }

    pub fn get(&self, component: Component) -> &Arc<Heartbeat> {
        match component {
            Component::Acquisition => &self.acquisition,
            Component::Detector => &self.detector,
            Component::Storage => &self.storage,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Heartbeat>> {
        [&self.acquisition, &self.detector, &self.storage].into_iter()
    }
}
