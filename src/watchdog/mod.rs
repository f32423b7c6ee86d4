//! # Watchdog Module
//!
//! Liveness supervision for the recorder.
//!
//! This module handles:
//! - Per-component heartbeats
//! - Incidents from the acquisition thread and the alerts they raise
//! - Keepalive sinks (systemd notify, `/dev/watchdog`)
//! - The supervisor task that ties them together

pub mod alerts;
pub mod heartbeat;
pub mod keepalive;
pub mod supervisor;

pub use alerts::{
    incident_channel, Alert, AlertCategory, AlertEscalation, Incident, IncidentReporter, Intensity, Severity,
};
pub use heartbeat::{Component, ComponentState, Heartbeat, Heartbeats};
pub use keepalive::{Keepalive, NoKeepalive, SystemdNotify, WatchdogDevice};
pub use supervisor::{HealthSnapshot, RebootRequest, WatchdogSupervisor};
