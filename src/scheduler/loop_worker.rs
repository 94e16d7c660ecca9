use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::{CycleMetrics, CycleOutcome, MetricsCollector},
    models::{RawFrame, Snapshot, SnapshotMeta, TemperatureReading, WindowSummary},
    publish::{DeliveryMode, PublishError, Publisher},
    sensors::Sensor,
    settings::Settings,
};

use super::CycleState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub type DistanceSensor = Box<dyn Sensor<Reading = Option<RawFrame>>>;
pub type TemperatureSensor = Box<dyn Sensor<Reading = TemperatureReading>>;
pub type RadarSensor = Box<dyn Sensor<Reading = WindowSummary>>;

pub enum SensorSlot<S> {
    Attached(S),
    /// Not configured, or not present at startup.
    Missing,
    /// The reader's task died and took its handle with it.
    Lost(&'static str),
}

/// A read in flight on the blocking pool, with the sensor it borrowed.
type PendingRead<S> = JoinHandle<(S, <S as Sensor>::Reading, Duration)>;

impl<S: Sensor + 'static> SensorSlot<S> {
    pub fn is_missing(&self) -> bool {
        matches!(self, SensorSlot::Missing)
    }

    /// Moves the sensor onto the blocking pool for one read. The slot reads
    /// as `Lost` until `settle` hands the sensor back.
    fn spawn_read(&mut self, cancel: &CancellationToken) -> Option<PendingRead<S>> {
        let mut sensor = match std::mem::replace(self, SensorSlot::Missing) {
            SensorSlot::Attached(sensor) => sensor,
            SensorSlot::Missing => return None,
            SensorSlot::Lost(name) => {
                log_error!("{name}: reader was lost in an earlier cycle, reporting absent");
                *self = SensorSlot::Lost(name);
                return None;
            }
        };
        *self = SensorSlot::Lost(sensor.name());

        let token = cancel.clone();
        Some(tokio::task::spawn_blocking(move || {
            let started = std::time::Instant::now();
            let reading = sensor.acquire(&token);
            (sensor, reading, started.elapsed())
        }))
    }

    fn settle(
        &mut self,
        joined: Option<Result<(S, S::Reading, Duration), JoinError>>,
    ) -> (Option<S::Reading>, Duration) {
        match joined {
            None => (None, Duration::ZERO),
            Some(Ok((sensor, reading, elapsed))) => {
                *self = SensorSlot::Attached(sensor);
                (Some(reading), elapsed)
            }
            Some(Err(err)) => {
                let name = match self {
                    SensorSlot::Lost(name) => *name,
                    _ => "sensor",
                };
                log_error!("{name}: reader task failed, detaching sensor: {err}");
                (None, Duration::ZERO)
            }
        }
    }
}

async fn join_read<T>(pending: Option<JoinHandle<T>>) -> Option<Result<T, JoinError>> {
    match pending {
        Some(handle) => Some(handle.await),
        None => None,
    }
}

pub struct SensorSet {
    pub distance: SensorSlot<DistanceSensor>,
    pub temperature: SensorSlot<TemperatureSensor>,
    pub radar: SensorSlot<RadarSensor>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub device_id: String,
    pub topic: String,
    pub interval: Duration,
    pub window: Duration,
    pub publish_timeout: Duration,
    pub delivery_mode: DeliveryMode,
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            device_id: settings.device_id.clone(),
            topic: settings.topic.clone(),
            interval: settings.interval(),
            window: settings.window(),
            publish_timeout: settings.publish_timeout(),
            delivery_mode: settings.delivery_mode(),
        }
    }
}

/// Periodic acquire → publish loop. Owns every sensor for its lifetime.
pub struct Scheduler {
    config: SchedulerConfig,
    sensors: SensorSet,
    publisher: Arc<dyn Publisher>,
    metrics: MetricsCollector,
    state_tx: watch::Sender<CycleState>,
}

impl Scheduler {
    pub fn new<P: Publisher + 'static>(
        config: SchedulerConfig,
        sensors: SensorSet,
        publisher: P,
    ) -> Result<Self> {
        if config.interval.is_zero() {
            bail!("cycle interval must be greater than zero");
        }
        if config.window > config.interval {
            bail!(
                "sampling window {:?} does not fit inside the {:?} cycle",
                config.window,
                config.interval
            );
        }

        let (state_tx, _) = watch::channel(CycleState::Idle);
        Ok(Self {
            config,
            sensors,
            publisher: Arc::new(publisher),
            metrics: MetricsCollector::new(),
            state_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    fn set_state(&self, state: CycleState) {
        log_debug!("scheduler state -> {}", state.as_str());
        self.state_tx.send_replace(state);
    }

    /// Runs until `cancel` fires. Cycles start every `interval`; a cycle
    /// that overruns delays the next tick rather than bunching them up.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log_info!(
            "scheduler started: topic={} interval={:?} window={:?}",
            self.config.topic,
            self.config.interval,
            self.config.window
        );

        loop {
            self.set_state(CycleState::Idle);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.run_cycle(&cancel).await == CycleOutcome::Cancelled {
                break;
            }
        }

        self.set_state(CycleState::Stopped);
        log_info!("scheduler shutting down");
    }

    /// One acquisition + publish. Sensor trouble only ever blanks fields;
    /// the snapshot is published (or dropped) either way.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleOutcome {
        let started_at = Utc::now();
        let cycle_start = Instant::now();
        self.set_state(CycleState::Acquiring);

        let distance = self.sensors.distance.spawn_read(cancel);
        let temperature = self.sensors.temperature.spawn_read(cancel);
        let radar = self.sensors.radar.spawn_read(cancel);

        let joined = tokio::select! {
            biased;
            _ = cancel.clone().cancelled_owned() => None,
            joined = async move {
                tokio::join!(join_read(distance), join_read(temperature), join_read(radar))
            } => Some(joined),
        };
        let Some((distance, temperature, radar)) = joined else {
            log_info!("cycle started {started_at} interrupted during acquisition");
            return CycleOutcome::Cancelled;
        };

        let (frame, distance_elapsed) = self.sensors.distance.settle(distance);
        let (temperature, temperature_elapsed) = self.sensors.temperature.settle(temperature);
        let (radar, radar_elapsed) = self.sensors.radar.settle(radar);

        let frame = frame.flatten();
        let temperature = temperature.unwrap_or_default();
        let finished_at = Utc::now();
        let acquisition_elapsed = cycle_start.elapsed();

        let mut absent_sensors = Vec::new();
        if frame.is_none() {
            absent_sensors.push("tf-luna".to_string());
        }
        if temperature.is_absent() {
            absent_sensors.push("mlx90614".to_string());
        }
        if radar.is_none() && !self.sensors.radar.is_missing() {
            absent_sensors.push("ld6002".to_string());
        }
        if !absent_sensors.is_empty() {
            log_debug!("cycle started {started_at}: no data from {}", absent_sensors.join(", "));
        }

        let meta = SnapshotMeta::new(
            &self.config.device_id,
            &self.config.topic,
            started_at,
            finished_at,
            self.config.interval.as_secs(),
            self.config.window.as_secs(),
        );
        let snapshot = Snapshot::new(meta, frame, temperature, radar);

        self.set_state(CycleState::Publishing);
        let publish_start = Instant::now();
        let (outcome, payload_bytes) = self.publish(&snapshot, started_at, cancel).await;
        let publish_elapsed = publish_start.elapsed();

        let (cpu_percent, memory_mb) = self.metrics.sample_system_metrics().await;
        let metrics = CycleMetrics {
            started_at,
            distance_ms: distance_elapsed.as_millis() as u64,
            temperature_ms: temperature_elapsed.as_millis() as u64,
            radar_ms: radar_elapsed.as_millis() as u64,
            acquisition_ms: acquisition_elapsed.as_millis() as u64,
            publish_ms: (outcome != CycleOutcome::Cancelled).then(|| publish_elapsed.as_millis() as u64),
            payload_bytes,
            absent_sensors,
            outcome,
            cpu_percent,
            memory_mb,
        };
        log_info!(
            "cycle {:?}: acquisition={}ms (tf-luna {}ms, mlx90614 {}ms, ld6002 {}ms) publish={:?}ms bytes={} cpu={:.1}% mem={:.1}MB",
            metrics.outcome,
            metrics.acquisition_ms,
            metrics.distance_ms,
            metrics.temperature_ms,
            metrics.radar_ms,
            metrics.publish_ms,
            metrics.payload_bytes,
            metrics.cpu_percent,
            metrics.memory_mb
        );
        self.metrics.record_cycle(metrics).await;

        outcome
    }

    /// At most one attempt per cycle, run as its own task so the cycle only
    /// waits on an owned handle. A failed snapshot is dropped; the next
    /// cycle supersedes it. On shutdown or timeout the attempt is aborted.
    async fn publish(
        &mut self,
        snapshot: &Snapshot,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (CycleOutcome, usize) {
        let payload = match snapshot.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!(
                    "dropping snapshot for cycle started {started_at}: {}",
                    PublishError::from(err)
                );
                return (CycleOutcome::PublishFailed, 0);
            }
        };
        let bytes = payload.len();

        let publisher = Arc::clone(&self.publisher);
        let topic = self.config.topic.clone();
        let mode = self.config.delivery_mode;
        let mut attempt =
            tokio::spawn(async move { publisher.publish(&topic, payload, mode).await });

        let result = tokio::select! {
            biased;
            _ = cancel.clone().cancelled_owned() => None,
            result = tokio::time::timeout(self.config.publish_timeout, &mut attempt) => Some(result),
        };

        let error = match result {
            None => {
                attempt.abort();
                let _ = attempt.await;
                log_info!("publish for cycle started {started_at} abandoned at shutdown");
                return (CycleOutcome::Cancelled, bytes);
            }
            Some(Ok(Ok(Ok(())))) => {
                log_info!("published topic={} bytes={bytes}", self.config.topic);
                return (CycleOutcome::Published, bytes);
            }
            Some(Ok(Ok(Err(err)))) => err,
            Some(Ok(Err(err))) => PublishError::Client(format!("publish task failed: {err}")),
            Some(Err(_elapsed)) => {
                attempt.abort();
                let _ = attempt.await;
                PublishError::Timeout(self.config.publish_timeout)
            }
        };

        log_warn!("dropping snapshot for cycle started {started_at}: {error}");
        (CycleOutcome::PublishFailed, bytes)
    }
}
