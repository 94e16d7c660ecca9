use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::MetricsCollector;

use super::{CycleState, Scheduler};

pub struct SchedulerController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    state_rx: Option<watch::Receiver<CycleState>>,
    metrics: Option<MetricsCollector>,
}

impl SchedulerController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            state_rx: None,
            metrics: None,
        }
    }

    /// Spawns the cycle loop. It stops when `shutdown` fires or on `stop()`.
    pub fn start(&mut self, scheduler: Scheduler, shutdown: &CancellationToken) -> Result<()> {
        if self.handle.is_some() {
            bail!("scheduler already running");
        }

        let cancel_token = shutdown.child_token();
        self.state_rx = Some(scheduler.subscribe());
        self.metrics = Some(scheduler.metrics());

        info!("Starting acquisition scheduler");
        let handle = tokio::spawn(scheduler.run(cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn state(&self) -> CycleState {
        self.state_rx
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn metrics(&self) -> Option<MetricsCollector> {
        self.metrics.clone()
    }

    /// Cancels the loop and waits for the in-flight cycle to unwind.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("scheduler task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for SchedulerController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawFrame, TemperatureReading, WindowSummary};
    use crate::publish::{DeliveryMode, PublishError, Publisher};
    use crate::scheduler::{SchedulerConfig, SensorSet, SensorSlot};
    use crate::sensors::Sensor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoFrame;

    impl Sensor for NoFrame {
        type Reading = Option<RawFrame>;
        fn name(&self) -> &'static str {
            "tf-luna"
        }
        fn acquire(&mut self, _cancel: &CancellationToken) -> Option<RawFrame> {
            None
        }
    }

    struct NoTemperature;

    impl Sensor for NoTemperature {
        type Reading = TemperatureReading;
        fn name(&self) -> &'static str {
            "mlx90614"
        }
        fn acquire(&mut self, _cancel: &CancellationToken) -> TemperatureReading {
            TemperatureReading::default()
        }
    }

    #[derive(Default)]
    struct CountingPublisher(AtomicUsize);

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _mode: DeliveryMode,
        ) -> Result<(), PublishError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scheduler(publisher: Arc<CountingPublisher>) -> Scheduler {
        let sensors = SensorSet {
            distance: SensorSlot::Attached(Box::new(NoFrame)),
            temperature: SensorSlot::Attached(Box::new(NoTemperature)),
            radar: SensorSlot::<Box<dyn Sensor<Reading = WindowSummary>>>::Missing,
        };
        let config = SchedulerConfig {
            device_id: "ctl".into(),
            topic: "zero2/ctl/sensor".into(),
            interval: Duration::from_secs(60),
            window: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(1),
            delivery_mode: DeliveryMode::AtMostOnce,
        };
        Scheduler::new(config, sensors, publisher).unwrap()
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let publisher = Arc::new(CountingPublisher::default());
        let shutdown = CancellationToken::new();
        let mut controller = SchedulerController::new();

        controller.start(scheduler(publisher.clone()), &shutdown).unwrap();
        assert!(controller.start(scheduler(publisher), &shutdown).is_err());

        controller.stop().await.unwrap();
        assert!(!controller.is_running());
        assert_eq!(controller.state(), CycleState::Stopped);
    }

    #[tokio::test]
    async fn parent_shutdown_stops_the_loop() {
        let publisher = Arc::new(CountingPublisher::default());
        let shutdown = CancellationToken::new();
        let mut controller = SchedulerController::new();
        controller.start(scheduler(publisher.clone()), &shutdown).unwrap();

        let metrics = controller.metrics().unwrap();
        while metrics.get_snapshot().await.cycle_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        controller.stop().await.unwrap();

        assert_eq!(controller.state(), CycleState::Stopped);
        assert_eq!(publisher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut controller = SchedulerController::default();
        assert_eq!(controller.state(), CycleState::Idle);
        controller.stop().await.unwrap();
    }
}
