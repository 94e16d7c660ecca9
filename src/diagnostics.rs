//! Bench runs for the MLX90614, outside the acquisition loop.
//!
//! Two modes: a short check (ten paired reads, stop at the first error) and
//! a long run (a warm-up of ambient-only reads, then paired reads at a fixed
//! rate until cancelled). Both are blocking and driven by a [`Clock`], so
//! they run on a plain thread or under `spawn_blocking`.

use std::{fmt, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::sensors::{
    mlx90614::REG_AMBIENT, Clock, RegisterBus, RegisterTempReader, SystemClock, POLL_INTERVAL,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    /// Ambient-only reads before sampling starts, one per `interval`.
    pub warmup: Duration,
    pub interval: Duration,
    /// `None` runs until cancelled.
    pub max_readings: Option<u32>,
    pub stop_on_error: bool,
}

impl BenchConfig {
    /// Ten reads a second apart; the first failure ends the run.
    pub fn check() -> Self {
        Self {
            warmup: Duration::ZERO,
            interval: Duration::from_secs(1),
            max_readings: Some(10),
            stop_on_error: true,
        }
    }

    /// One minute of warm-up, then 1 Hz until cancelled.
    pub fn longrun() -> Self {
        Self {
            warmup: Duration::from_secs(60),
            interval: Duration::from_secs(1),
            max_readings: None,
            stop_on_error: false,
        }
    }

    fn warmup_reads(&self) -> u64 {
        if self.interval.is_zero() {
            return 0;
        }
        (self.warmup.as_millis() / self.interval.as_millis().max(1)) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchSample {
    /// 1-based attempt number.
    pub index: u32,
    /// Since the end of warm-up.
    pub elapsed: Duration,
    pub ambient_c: f64,
    pub object_c: f64,
}

impl fmt::Display for BenchSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:05}] t={:7.1}s  Ambient={:6.2} °C  Object={:6.2} °C",
            self.index,
            self.elapsed.as_secs_f64(),
            self.ambient_c,
            self.object_c
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    #[default]
    Cancelled,
    Completed,
    ReadFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BenchSummary {
    pub warmup_reads: u64,
    pub warmup_failures: u64,
    pub samples: u32,
    pub failures: u32,
    pub stopped_by: StopReason,
}

pub struct Mlx90614Bench<B, C = SystemClock> {
    reader: RegisterTempReader<B>,
    clock: C,
    config: BenchConfig,
}

impl<B: RegisterBus> Mlx90614Bench<B, SystemClock> {
    pub fn new(reader: RegisterTempReader<B>, config: BenchConfig) -> Self {
        Self::with_clock(reader, config, SystemClock)
    }
}

impl<B: RegisterBus, C: Clock> Mlx90614Bench<B, C> {
    pub fn with_clock(reader: RegisterTempReader<B>, config: BenchConfig, clock: C) -> Self {
        Self {
            reader,
            clock,
            config,
        }
    }

    /// Runs warm-up and sampling, handing each good sample to `on_sample`.
    pub fn run(
        &mut self,
        cancel: &CancellationToken,
        mut on_sample: impl FnMut(&BenchSample),
    ) -> BenchSummary {
        let mut summary = BenchSummary::default();

        for _ in 0..self.config.warmup_reads() {
            if cancel.is_cancelled() {
                return summary;
            }
            summary.warmup_reads += 1;
            if let Err(err) = self.reader.read_register(REG_AMBIENT) {
                summary.warmup_failures += 1;
                log_debug!("mlx90614 bench: warm-up read failed: {err}");
            }
            if !self.pause(cancel) {
                return summary;
            }
        }

        let start = self.clock.now();
        let mut index = 0u32;
        loop {
            if cancel.is_cancelled() {
                summary.stopped_by = StopReason::Cancelled;
                return summary;
            }
            if self.config.max_readings.is_some_and(|max| index >= max) {
                summary.stopped_by = StopReason::Completed;
                return summary;
            }
            index += 1;

            match self.reader.try_read() {
                Ok((ambient_c, object_c)) => {
                    summary.samples += 1;
                    on_sample(&BenchSample {
                        index,
                        elapsed: self.clock.now() - start,
                        ambient_c,
                        object_c,
                    });
                }
                Err(err) => {
                    summary.failures += 1;
                    log_warn!("mlx90614 bench: read {index} failed: {err}");
                    if self.config.stop_on_error {
                        summary.stopped_by = StopReason::ReadFailed;
                        return summary;
                    }
                }
            }

            let last = self.config.max_readings.is_some_and(|max| index >= max);
            if !last && !self.pause(cancel) {
                summary.stopped_by = StopReason::Cancelled;
                return summary;
            }
        }
    }

    /// Sleeps one interval in short slices. Returns false if cancelled.
    fn pause(&self, cancel: &CancellationToken) -> bool {
        let deadline = self.clock.now() + self.config.interval;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            self.clock.sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{mlx90614::REG_OBJECT, ManualClock, SensorError};
    use std::{collections::VecDeque, sync::Arc};

    /// Answers from a script of per-read results, then repeats the last one.
    struct ScriptedBus {
        script: VecDeque<Result<u16, ()>>,
        last: Result<u16, ()>,
        reads: Vec<u8>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedBus {
        fn steady(raw: u16) -> Self {
            Self {
                script: VecDeque::new(),
                last: Ok(raw),
                reads: Vec::new(),
                cancel_after: None,
            }
        }

        fn then(mut self, step: Result<u16, ()>) -> Self {
            self.script.push_back(step);
            self
        }
    }

    impl RegisterBus for ScriptedBus {
        fn read_register16(&mut self, _address: u8, register: u8) -> Result<u16, SensorError> {
            self.reads.push(register);
            if let Some((after, token)) = &self.cancel_after {
                if self.reads.len() >= *after {
                    token.cancel();
                }
            }
            let step = self.script.pop_front().unwrap_or(self.last);
            step.map_err(|()| SensorError::Bus("nack".into()))
        }
    }

    fn bench(
        bus: ScriptedBus,
        config: BenchConfig,
    ) -> (Mlx90614Bench<ScriptedBus, Arc<ManualClock>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let bench = Mlx90614Bench::with_clock(RegisterTempReader::new(bus), config, clock.clone());
        (bench, clock)
    }

    #[test]
    fn check_takes_ten_paired_reads_a_second_apart() {
        let (mut bench, clock) = bench(ScriptedBus::steady(15_000), BenchConfig::check());
        let mut samples = Vec::new();

        let summary = bench.run(&CancellationToken::new(), |s| samples.push(*s));

        assert_eq!(summary.stopped_by, StopReason::Completed);
        assert_eq!(summary.samples, 10);
        assert_eq!(summary.warmup_reads, 0);
        assert_eq!(samples.len(), 10);
        assert_eq!(samples[0].index, 1);
        assert_eq!(samples[9].elapsed, Duration::from_secs(9));
        assert_eq!(samples[9].object_c, 26.85);
        assert_eq!(clock.elapsed(), Duration::from_secs(9));
        assert_eq!(bench.reader_reads().len(), 20);
    }

    #[test]
    fn check_stops_at_first_error() {
        let bus = ScriptedBus::steady(15_000)
            .then(Ok(14_908))
            .then(Ok(15_000))
            .then(Err(()));
        let (mut bench, _clock) = bench(bus, BenchConfig::check());
        let mut samples = Vec::new();

        let summary = bench.run(&CancellationToken::new(), |s| samples.push(*s));

        assert_eq!(summary.stopped_by, StopReason::ReadFailed);
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.failures, 1);
        assert_eq!(samples[0].ambient_c, 25.01);
        // Ambient failed, so the object register was never asked for.
        assert_eq!(bench.reader_reads(), vec![REG_AMBIENT, REG_OBJECT, REG_AMBIENT]);
    }

    #[test]
    fn longrun_warms_up_on_ambient_and_ignores_warmup_errors() {
        let mut bus = ScriptedBus::steady(15_000).then(Err(())).then(Err(()));
        let cancel = CancellationToken::new();
        // 60 warm-up reads, then three pairs.
        bus.cancel_after = Some((66, cancel.clone()));
        let (mut bench, _clock) = bench(bus, BenchConfig::longrun());
        let mut samples = Vec::new();

        let summary = bench.run(&cancel, |s| samples.push(*s));

        assert_eq!(summary.warmup_reads, 60);
        assert_eq!(summary.warmup_failures, 2);
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.stopped_by, StopReason::Cancelled);

        let reads = bench.reader_reads();
        assert!(reads[..60].iter().all(|r| *r == REG_AMBIENT));
        assert_eq!(&reads[60..62], &[REG_AMBIENT, REG_OBJECT]);

        assert_eq!(samples[0].elapsed, Duration::ZERO);
        assert_eq!(samples[2].index, 3);
        assert_eq!(samples[2].elapsed, Duration::from_secs(2));
    }

    #[test]
    fn longrun_keeps_sampling_after_a_failed_read() {
        let cancel = CancellationToken::new();
        let mut bus = ScriptedBus::steady(15_000).then(Err(()));
        bus.cancel_after = Some((5, cancel.clone()));
        let config = BenchConfig {
            warmup: Duration::ZERO,
            ..BenchConfig::longrun()
        };
        let (mut bench, _clock) = bench(bus, config);
        let mut samples = Vec::new();

        let summary = bench.run(&cancel, |s| samples.push(*s));

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.samples, 2);
        assert_eq!(samples[0].index, 2);
    }

    #[test]
    fn cancelled_before_start_reads_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (mut bench, clock) = bench(ScriptedBus::steady(15_000), BenchConfig::longrun());

        let summary = bench.run(&cancel, |_| panic!("no samples expected"));

        assert_eq!(summary, BenchSummary::default());
        assert!(bench.reader_reads().is_empty());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn sample_line_is_fixed_width() {
        let sample = BenchSample {
            index: 1,
            elapsed: Duration::from_millis(3_300),
            ambient_c: 25.01,
            object_c: -4.5,
        };
        assert_eq!(
            sample.to_string(),
            "[00001] t=    3.3s  Ambient= 25.01 °C  Object= -4.50 °C"
        );
    }

    impl<C> Mlx90614Bench<ScriptedBus, C> {
        fn reader_reads(&self) -> Vec<u8> {
            self.reader.bus().reads.clone()
        }
    }
}
