use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Published,
    PublishFailed,
    /// Shutdown arrived mid-cycle; nothing was published.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub started_at: DateTime<Utc>,
    pub distance_ms: u64,
    pub temperature_ms: u64,
    pub radar_ms: u64,
    pub acquisition_ms: u64,
    pub publish_ms: Option<u64>,
    pub payload_bytes: usize,
    /// Sensors that produced nothing this cycle.
    pub absent_sensors: Vec<String>,
    pub outcome: CycleOutcome,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub recent_cycles: Vec<CycleMetrics>,
    pub cycle_count: u64,
    pub publish_failures: u64,
    pub sensor_absences: u64,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            system: SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
            recent_cycles: Vec::new(),
            cycle_count: 0,
            publish_failures: 0,
            sensor_absences: 0,
        }
    }
}
