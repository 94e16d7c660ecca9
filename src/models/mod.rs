pub mod reading;
pub mod snapshot;

pub use reading::{RawFrame, TemperatureReading, WindowSummary};
pub use snapshot::{DistanceReport, Snapshot, SnapshotMeta, TemperatureReport};
