//! Per-sensor readings produced by one acquisition cycle.

use serde::{Deserialize, Serialize};

/// One decoded TF-Luna frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub distance_cm: u16,
    pub signal_strength: u16,
}

/// MLX90614 ambient/object temperatures. Each field is read independently,
/// so either one may be missing on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub ambient_c: Option<f64>,
    pub object_c: Option<f64>,
}

impl TemperatureReading {
    /// Both registers were read this cycle.
    pub fn is_complete(&self) -> bool {
        self.ambient_c.is_some() && self.object_c.is_some()
    }

    pub fn is_absent(&self) -> bool {
        self.ambient_c.is_none() && self.object_c.is_none()
    }
}

/// Statistics over one radar sampling window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub bytes_total: u64,
    pub chunks_total: u64,
    pub chunks_nonzero: u64,
    /// Hex of the first non-zero chunks seen, oldest first.
    pub samples: Vec<String>,
}
