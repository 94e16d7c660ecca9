//! HLK-LD6002 radar, sampled as raw bytes.
//!
//! The module's UART output has no framing we can rely on, so instead of
//! decoding it we drain it for a fixed window and summarise what came by.

use std::{fmt::Write as _, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::models::WindowSummary;

use super::{ByteSource, Clock, Sensor, SystemClock, POLL_INTERVAL};

const ENABLE_LOGS: bool = true;

use crate::log_debug;

pub const MAX_CHUNK_BYTES: usize = 256;
pub const MAX_SAMPLES: usize = 10;
/// Source bytes kept per sample, before hex encoding.
pub const SAMPLE_SOURCE_BYTES: usize = 60;

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

impl WindowSummary {
    /// Counts every chunk; only chunks with a non-zero byte may become samples.
    pub fn record_chunk(&mut self, chunk: &[u8]) {
        self.chunks_total += 1;
        self.bytes_total += chunk.len() as u64;

        if chunk.iter().any(|&b| b != 0x00) {
            self.chunks_nonzero += 1;
            if self.samples.len() < MAX_SAMPLES {
                let kept = &chunk[..chunk.len().min(SAMPLE_SOURCE_BYTES)];
                self.samples.push(hex_encode(kept));
            }
        }
    }
}

pub struct WindowedByteSampler<S, C = SystemClock> {
    source: S,
    clock: C,
    window: Duration,
}

impl<S: ByteSource> WindowedByteSampler<S, SystemClock> {
    pub fn new(source: S, window: Duration) -> Self {
        Self::with_clock(source, window, SystemClock)
    }
}

impl<S: ByteSource, C: Clock> WindowedByteSampler<S, C> {
    pub fn with_clock(source: S, window: Duration, clock: C) -> Self {
        Self {
            source,
            clock,
            window,
        }
    }

    /// Drains the source until `window` has elapsed.
    ///
    /// Never returns before the deadline (unless cancelled) and overshoots it
    /// by at most one poll or one chunk read. Read errors count as an empty
    /// tick.
    pub fn sample(&mut self, window: Duration, cancel: &CancellationToken) -> WindowSummary {
        let deadline = self.clock.now() + window;
        let mut summary = WindowSummary::default();
        let mut chunk = [0u8; MAX_CHUNK_BYTES];
        let mut io_errors = 0usize;

        loop {
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            if cancel.is_cancelled() {
                log_debug!("ld6002: window cut short by shutdown");
                break;
            }

            let available = self.source.bytes_available().unwrap_or_else(|err| {
                io_errors += 1;
                log_debug!("ld6002: poll failed: {err}");
                0
            });
            if available == 0 {
                self.clock.sleep(POLL_INTERVAL.min(deadline - now));
                continue;
            }

            let want = available.min(MAX_CHUNK_BYTES);
            match self.source.read_bytes(&mut chunk[..want]) {
                Ok(0) => self.clock.sleep(POLL_INTERVAL.min(deadline - now)),
                Ok(n) => summary.record_chunk(&chunk[..n]),
                Err(err) => {
                    io_errors += 1;
                    log_debug!("ld6002: read failed: {err}");
                    self.clock.sleep(POLL_INTERVAL.min(deadline - now));
                }
            }
        }

        if io_errors > 0 {
            log_debug!("ld6002: {io_errors} transient I/O errors during window");
        }
        summary
    }
}

impl<S, C> Sensor for WindowedByteSampler<S, C>
where
    S: ByteSource + 'static,
    C: Clock + 'static,
{
    type Reading = WindowSummary;

    fn name(&self) -> &'static str {
        "ld6002"
    }

    fn acquire(&mut self, cancel: &CancellationToken) -> WindowSummary {
        if let Err(err) = self.source.discard_pending() {
            log_debug!("ld6002: could not discard stale input: {err}");
        }
        self.sample(self.window, cancel)
    }
}
