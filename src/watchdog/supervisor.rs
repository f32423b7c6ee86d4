//! # Watchdog Supervisor
//!
//! Periodic health evaluation. Every tick the supervisor:
//!
//! 1. Drains incidents reported by the acquisition thread
//! 2. Classifies each heartbeat as Healthy, Stale or Dead and alerts on
//!    transitions (and again every re-alert interval while unhealthy)
//! 3. Pets the keepalive only when everything is Healthy and no fatal
//!    incident has been seen
//! 4. Publishes a [`HealthSnapshot`]
//!
//! Alerts are suppressed during the start-up grace window.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::alerts::{Alert, AlertCategory, AlertEscalation, Incident, Severity};
use super::heartbeat::{Component, ComponentState, Heartbeats};
use super::keepalive::Keepalive;
use crate::config::WatchdogConfig;

/// Capacity of the alert broadcast; slow subscribers see `Lagged`
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Result of one supervisor tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub states: BTreeMap<Component, ComponentState>,
    /// An unrecoverable incident has been reported
    pub fatal: bool,
    pub keepalive_sent: bool,
    pub in_grace: bool,
}

impl HealthSnapshot {
    pub fn all_healthy(&self) -> bool {
        self.states.values().all(|s| *s == ComponentState::Healthy)
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            states: Component::ALL
                .iter()
                .map(|c| (*c, ComponentState::Healthy))
                .collect(),
            fatal: false,
            keepalive_sent: false,
            in_grace: true,
        }
    }
}

/// Published when the unit needs a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootRequest {
    pub cause: AlertCategory,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    state: ComponentState,
    alerted_at: Option<Instant>,
}

pub struct WatchdogSupervisor {
    heartbeats: Heartbeats,
    incidents: mpsc::Receiver<Incident>,
    keepalive: Box<dyn Keepalive>,
    alerts: broadcast::Sender<Alert>,
    health: watch::Sender<HealthSnapshot>,
    reboot: watch::Sender<Option<RebootRequest>>,
    escalation: AlertEscalation,
    tracked: BTreeMap<Component, Tracked>,
    fatal: bool,
    started: Instant,
    grace: Duration,
    tick: Duration,
    realert_interval: Duration,
    keepalive_failures: u64,
}

impl WatchdogSupervisor {
    pub fn new(
        config: &WatchdogConfig,
        heartbeats: Heartbeats,
        incidents: mpsc::Receiver<Incident>,
        keepalive: Box<dyn Keepalive>,
        started: Instant,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let (health, _) = watch::channel(HealthSnapshot::default());
        let (reboot, _) = watch::channel(None);

        let tracked = Component::ALL
            .iter()
            .map(|c| {
                (
                    *c,
                    Tracked {
                        state: ComponentState::Healthy,
                        alerted_at: None,
                    },
                )
            })
            .collect();

        Self {
            heartbeats,
            incidents,
            keepalive,
            alerts,
            health,
            reboot,
            escalation: AlertEscalation::new(config.escalation_window()),
            tracked,
            fatal: false,
            started,
            grace: config.startup_grace(),
            tick: config.tick(),
            realert_interval: config.realert_interval(),
            keepalive_failures: 0,
        }
    }

    /// Alert stream
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Latest health snapshot
    pub fn health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.subscribe()
    }

    /// Reboot requests; `None` until one is made
    pub fn reboot_requests(&self) -> watch::Receiver<Option<RebootRequest>> {
        self.reboot.subscribe()
    }

    pub fn keepalive_failures(&self) -> u64 {
        self.keepalive_failures
    }

    fn in_grace(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.grace
    }

    /// Run one evaluation at `now`
    pub fn tick_at(&mut self, now: Instant) -> HealthSnapshot {
        let in_grace = self.in_grace(now);

        while let Ok(incident) = self.incidents.try_recv() {
            self.handle_incident(incident, now, in_grace);
        }

        let states: BTreeMap<Component, ComponentState> = self
            .heartbeats
            .iter()
            .map(|hb| (hb.component(), hb.state_at(now)))
            .collect();

        // Transitions inside the grace window are not recorded, so a fault
        // that outlives it is alerted once the window closes
        if !in_grace {
            for (component, state) in &states {
                self.evaluate(*component, *state, now);
            }
        }

        let all_healthy = states.values().all(|s| *s == ComponentState::Healthy);
        let keepalive_sent = if all_healthy && !self.fatal {
            match self.keepalive.pet() {
                Ok(()) => true,
                Err(e) => {
                    self.keepalive_failures += 1;
                    warn!(keepalive = self.keepalive.name(), error = %e, "Keepalive failed");
                    false
                }
            }
        } else {
            debug!(all_healthy, fatal = self.fatal, "Keepalive withheld");
            false
        };

        let snapshot = HealthSnapshot {
            states,
            fatal: self.fatal,
            keepalive_sent,
            in_grace,
        };
        self.health.send_replace(snapshot.clone());
        snapshot
    }

    fn handle_incident(&mut self, incident: Incident, now: Instant, in_grace: bool) {
        match incident {
            Incident::BusLockup { consecutive_failures } => {
                warn!(consecutive_failures, "Bus lockup reported");
                self.emit(AlertCategory::BusLockup, Severity::Warning, now, in_grace);
            }
            Incident::BusRecovered => {
                info!("Bus recovered");
                self.emit_recovery(AlertCategory::BusLockup, in_grace);
            }
            Incident::BusRecoveryFailed => {
                error!("Bus recovery failed, requesting reboot");
                self.fatal = true;
                self.emit(AlertCategory::BusRecoveryFailed, Severity::Critical, now, in_grace);
                self.reboot.send_replace(Some(RebootRequest {
                    cause: AlertCategory::BusRecoveryFailed,
                }));
            }
        }
    }

    fn evaluate(&mut self, component: Component, state: ComponentState, now: Instant) {
        let Some(previous) = self.tracked.get(&component).copied() else {
            return;
        };

        if state != previous.state {
            let alerted_at = match state {
                ComponentState::Healthy => {
                    let category = match previous.state {
                        ComponentState::Dead => AlertCategory::Dead(component),
                        _ => AlertCategory::Stalled(component),
                    };
                    info!(component = %component, "Component recovered");
                    self.emit_recovery(category, false);
                    self.escalation.reset(AlertCategory::Stalled(component));
                    self.escalation.reset(AlertCategory::Dead(component));
                    None
                }
                ComponentState::Stale => {
                    self.emit(AlertCategory::Stalled(component), Severity::Warning, now, false);
                    Some(now)
                }
                ComponentState::Dead => {
                    self.emit(AlertCategory::Dead(component), Severity::Critical, now, false);
                    Some(now)
                }
            };
            self.tracked.insert(component, Tracked { state, alerted_at });
            return;
        }

        if state == ComponentState::Healthy {
            return;
        }

        let due = previous
            .alerted_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.realert_interval);
        if due {
            let (category, severity) = match state {
                ComponentState::Dead => (AlertCategory::Dead(component), Severity::Critical),
                _ => (AlertCategory::Stalled(component), Severity::Warning),
            };
            self.emit(category, severity, now, false);
            self.tracked.insert(
                component,
                Tracked {
                    state,
                    alerted_at: Some(now),
                },
            );
        }
    }

    fn emit(&mut self, category: AlertCategory, severity: Severity, now: Instant, in_grace: bool) {
        if in_grace {
            debug!(category = %category, "Alert suppressed during start-up grace");
            return;
        }

        let intensity = self.escalation.record(category, now);
        match severity {
            Severity::Critical => error!(category = %category, ?intensity, "Alert"),
            _ => warn!(category = %category, ?intensity, "Alert"),
        }
        self.dispatch(Alert {
            category,
            severity,
            intensity,
            is_recovery: false,
        });
    }

    fn emit_recovery(&mut self, category: AlertCategory, in_grace: bool) {
        if in_grace {
            debug!(category = %category, "Recovery alert suppressed during start-up grace");
            return;
        }
        self.dispatch(Alert::recovery(category));
    }

    fn dispatch(&self, alert: Alert) {
        // No subscribers is fine; alerts are also in the log
        let _ = self.alerts.send(alert);
    }

    /// Tick until `stop` flips
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(
            tick_ms = self.tick.as_millis() as u64,
            grace_s = self.grace.as_secs(),
            keepalive = self.keepalive.name(),
            "Watchdog supervisor started"
        );

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_at(Instant::now());
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(keepalive_failures = self.keepalive_failures, "Watchdog supervisor stopped");
    }
}
