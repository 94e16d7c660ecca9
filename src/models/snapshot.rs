//! Snapshot data model.
//!
//! One snapshot is built per acquisition cycle, handed to the publisher and
//! then dropped. The JSON shape is the wire contract consumed downstream:
//! top-level keys are exactly `meta`, `distance`, `temperature` and `radar`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RawFrame, TemperatureReading, WindowSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub device_id: String,
    pub topic: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interval_sec: u64,
    pub window_sec: u64,
}

impl SnapshotMeta {
    /// Wall clocks can step backwards between the two samples; `finished_at`
    /// is clamped so it never precedes `started_at`.
    pub fn new(
        device_id: impl Into<String>,
        topic: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        interval_sec: u64,
        window_sec: u64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            topic: topic.into(),
            started_at,
            finished_at: finished_at.max(started_at),
            interval_sec,
            window_sec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceReport {
    pub ok: bool,
    pub distance_cm: Option<u16>,
    pub signal_strength: Option<u16>,
}

impl From<Option<RawFrame>> for DistanceReport {
    fn from(frame: Option<RawFrame>) -> Self {
        Self {
            ok: frame.is_some(),
            distance_cm: frame.map(|f| f.distance_cm),
            signal_strength: frame.map(|f| f.signal_strength),
        }
    }
}

impl DistanceReport {
    pub fn frame(&self) -> Option<RawFrame> {
        match (self.distance_cm, self.signal_strength) {
            (Some(distance_cm), Some(signal_strength)) => Some(RawFrame {
                distance_cm,
                signal_strength,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReport {
    /// True only when both registers were read.
    pub ok: bool,
    pub ambient_c: Option<f64>,
    pub object_c: Option<f64>,
}

impl From<TemperatureReading> for TemperatureReport {
    fn from(reading: TemperatureReading) -> Self {
        Self {
            ok: reading.is_complete(),
            ambient_c: reading.ambient_c,
            object_c: reading.object_c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub distance: DistanceReport,
    pub temperature: TemperatureReport,
    /// `None` when no radar port is attached.
    pub radar: Option<WindowSummary>,
}

impl Snapshot {
    pub fn new(
        meta: SnapshotMeta,
        frame: Option<RawFrame>,
        temperature: TemperatureReading,
        radar: Option<WindowSummary>,
    ) -> Self {
        Self {
            meta,
            distance: frame.into(),
            temperature: temperature.into(),
            radar,
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
