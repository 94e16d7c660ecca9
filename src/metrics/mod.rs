mod types;

pub use types::{CycleMetrics, CycleOutcome, MetricsSnapshot, SystemMetrics};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_CYCLES: usize = 20;

/// In-process bookkeeping of recent cycles. Never published.
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_cycles: Vec<CycleMetrics>,
    cycle_count: u64,
    publish_failures: u64,
    sensor_absences: u64,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_cycles: Vec::with_capacity(MAX_RECENT_CYCLES),
                cycle_count: 0,
                publish_failures: 0,
                sensor_absences: 0,
                system,
                pid,
            })),
        }
    }

    /// Current process CPU % and resident memory in MiB. CPU usage is a
    /// delta, so the first sample after startup reads as zero.
    pub async fn sample_system_metrics(&self) -> (f32, f64) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        if let Some(process) = state.system.process(pid) {
            (
                process.cpu_usage(),
                process.memory() as f64 / 1024.0 / 1024.0,
            )
        } else {
            (0.0, 0.0)
        }
    }

    pub async fn record_cycle(&self, metrics: CycleMetrics) {
        let mut state = self.inner.lock().await;

        state.cycle_count += 1;
        state.sensor_absences += metrics.absent_sensors.len() as u64;
        if metrics.outcome == CycleOutcome::PublishFailed {
            state.publish_failures += 1;
        }

        state.recent_cycles.push(metrics);

        if state.recent_cycles.len() > MAX_RECENT_CYCLES {
            state.recent_cycles.remove(0);
        }
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system = if let Some(process) = state.system.process(pid) {
            SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            }
        } else {
            MetricsSnapshot::default().system
        };

        MetricsSnapshot {
            system,
            recent_cycles: state.recent_cycles.clone(),
            cycle_count: state.cycle_count,
            publish_failures: state.publish_failures,
            sensor_absences: state.sensor_absences,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cycle(outcome: CycleOutcome, absent: &[&str]) -> CycleMetrics {
        CycleMetrics {
            started_at: Utc::now(),
            distance_ms: 3,
            temperature_ms: 1,
            radar_ms: 5_000,
            acquisition_ms: 5_001,
            publish_ms: Some(2),
            payload_bytes: 512,
            absent_sensors: absent.iter().map(|s| s.to_string()).collect(),
            outcome,
            cpu_percent: 0.0,
            memory_mb: 0.0,
        }
    }

    #[tokio::test]
    async fn counts_failures_and_absences() {
        let metrics = MetricsCollector::new();
        metrics.record_cycle(cycle(CycleOutcome::Published, &[])).await;
        metrics
            .record_cycle(cycle(CycleOutcome::PublishFailed, &["tf-luna", "ld6002"]))
            .await;

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.cycle_count, 2);
        assert_eq!(snapshot.publish_failures, 1);
        assert_eq!(snapshot.sensor_absences, 2);
        assert_eq!(snapshot.recent_cycles.len(), 2);
    }

    #[tokio::test]
    async fn keeps_only_recent_cycles() {
        let metrics = MetricsCollector::new();
        for _ in 0..(MAX_RECENT_CYCLES + 5) {
            metrics.record_cycle(cycle(CycleOutcome::Published, &[])).await;
        }

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.cycle_count, (MAX_RECENT_CYCLES + 5) as u64);
        assert_eq!(snapshot.recent_cycles.len(), MAX_RECENT_CYCLES);
    }
}
