//! Durable record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventId, EventSummary};
use crate::sensor::Sample;

/// Monotonically increasing record identity assigned by the store
pub type RecordId = u64;

/// Source of a telemetry reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    #[serde(rename = "gps")]
    Gps,
    #[serde(rename = "imu")]
    Imu,
    #[serde(rename = "temp")]
    Temperature,
    #[serde(rename = "system")]
    System,
}

/// Generic telemetry reading; only the fields of its sensor type are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub sensor_type: SensorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude_m: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accel_z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gyro_z: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_celsius: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_temp_celsius: Option<f64>,
}

impl Reading {
    fn empty(timestamp: DateTime<Utc>, sensor_type: SensorType) -> Self {
        Self {
            timestamp,
            sensor_type,
            latitude: None,
            longitude: None,
            altitude_m: None,
            speed_kmh: None,
            heading_deg: None,
            satellites: None,
            accel_x: None,
            accel_y: None,
            accel_z: None,
            gyro_x: None,
            gyro_y: None,
            gyro_z: None,
            temp_celsius: None,
            cpu_temp_celsius: None,
        }
    }

    /// IMU reading from a raw sample, stamped with the sample's own clock
    pub fn imu(sample: &Sample) -> Self {
        let micros = (sample.timestamp * 1_000_000.0).round() as i64;
        let timestamp = DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now);
        Self {
            accel_x: Some(sample.ax),
            accel_y: Some(sample.ay),
            accel_z: Some(sample.az),
            gyro_x: Some(sample.gx),
            gyro_y: Some(sample.gy),
            gyro_z: Some(sample.gz),
            ..Self::empty(timestamp, SensorType::Imu)
        }
    }

    pub fn gps(
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        speed_kmh: Option<f64>,
        satellites: Option<u8>,
    ) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            speed_kmh,
            satellites,
            ..Self::empty(timestamp, SensorType::Gps)
        }
    }

    pub fn temperature(timestamp: DateTime<Utc>, celsius: f64) -> Self {
        Self {
            temp_celsius: Some(celsius),
            ..Self::empty(timestamp, SensorType::Temperature)
        }
    }

    pub fn system(timestamp: DateTime<Utc>, cpu_temp_celsius: f64) -> Self {
        Self {
            cpu_temp_celsius: Some(cpu_temp_celsius),
            ..Self::empty(timestamp, SensorType::System)
        }
    }
}

/// Content of a durable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Reading(Reading),
    Event(EventSummary),
}

impl RecordPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordPayload::Reading(_) => "reading",
            RecordPayload::Event(_) => "event",
        }
    }

    pub fn event_id(&self) -> Option<EventId> {
        match self {
            RecordPayload::Reading(_) => None,
            RecordPayload::Event(summary) => Some(summary.id),
        }
    }
}

/// A committed row as seen by sync consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub id: RecordId,
    pub recorded_at: DateTime<Utc>,
    pub payload: RecordPayload,
}

/// Per-consumer sync progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub name: String,
    pub last_synced_id: RecordId,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventType};

    #[test]
    fn test_imu_reading_keeps_sample_clock() {
        let sample = Sample {
            timestamp: 1_700_000_000.25,
            ax: 0.1,
            ay: -0.2,
            az: 1.0,
            gx: 3.0,
            gy: 0.0,
            gz: -1.5,
        };
        let reading = Reading::imu(&sample);

        assert_eq!(reading.sensor_type, SensorType::Imu);
        assert_eq!(reading.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(reading.timestamp.timestamp_subsec_millis(), 250);
        assert_eq!(reading.gyro_z, Some(-1.5));
        assert_eq!(reading.latitude, None);
    }

    #[test]
    fn test_payload_json_shape() {
        let reading = Reading::temperature(Utc::now(), 41.5);
        let json = serde_json::to_value(RecordPayload::Reading(reading)).unwrap();

        assert_eq!(json["kind"], "reading");
        assert_eq!(json["sensor_type"], "temp");
        assert_eq!(json["temp_celsius"], 41.5);
        // Unset fields are omitted
        assert!(json.get("latitude").is_none());
    }

    #[test]
    fn test_event_payload_carries_id() {
        let event = Event::begin(EventType::BigCorner, &Sample::accel(5.0, 0.0, 0.7, 1.0), 0.7);
        let payload = RecordPayload::Event(event.summary());

        assert_eq!(payload.kind(), "event");
        assert_eq!(payload.event_id(), Some(event.id));

        let json = serde_json::to_string(&payload).unwrap();
        let back: RecordPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
