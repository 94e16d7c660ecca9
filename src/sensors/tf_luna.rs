//! TF-Luna distance sensor.
//!
//! The sensor streams 9-byte frames continuously:
//!
//! ```text
//! 0x59 0x59 | dist_l dist_h | strength_l strength_h | temp_l temp_h | checksum
//! ```
//!
//! Nothing marks a frame boundary except the double header byte, so every
//! read starts from a fresh sync state and hunts for it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::models::RawFrame;

use super::{ByteSource, Clock, Sensor, SensorError, SystemClock, POLL_INTERVAL};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

pub const HEADER_BYTE: u8 = 0x59;
pub const FRAME_LEN: usize = 9;
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Hunting,
    HalfHeader,
    Payload { filled: usize },
}

/// Byte-at-a-time header sync. Feed it bytes; it hands back a complete
/// frame (header included) each time one closes.
#[derive(Debug, Clone)]
pub struct FrameSync {
    state: SyncState,
    frame: [u8; FRAME_LEN],
}

impl FrameSync {
    pub fn new() -> Self {
        Self {
            state: SyncState::Hunting,
            frame: [0; FRAME_LEN],
        }
    }

    /// How many bytes can be consumed without running past the current frame.
    pub fn bytes_wanted(&self) -> usize {
        match self.state {
            SyncState::Hunting | SyncState::HalfHeader => 1,
            SyncState::Payload { filled } => FRAME_LEN - filled,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<[u8; FRAME_LEN]> {
        match self.state {
            SyncState::Hunting => {
                if byte == HEADER_BYTE {
                    self.state = SyncState::HalfHeader;
                }
                None
            }
            SyncState::HalfHeader => {
                if byte == HEADER_BYTE {
                    self.frame[0] = HEADER_BYTE;
                    self.frame[1] = HEADER_BYTE;
                    self.state = SyncState::Payload { filled: 2 };
                } else {
                    self.state = SyncState::Hunting;
                }
                None
            }
            SyncState::Payload { filled } => {
                self.frame[filled] = byte;
                let filled = filled + 1;
                if filled == FRAME_LEN {
                    self.state = SyncState::Hunting;
                    Some(self.frame)
                } else {
                    self.state = SyncState::Payload { filled };
                    None
                }
            }
        }
    }
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> RawFrame {
    RawFrame {
        distance_cm: u16::from_le_bytes([frame[2], frame[3]]),
        signal_strength: u16::from_le_bytes([frame[4], frame[5]]),
    }
}

/// Low byte of the sum of everything before the checksum byte.
pub fn frame_checksum(frame: &[u8; FRAME_LEN]) -> u8 {
    frame[..FRAME_LEN - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

pub struct FrameDecoder<S, C = SystemClock> {
    source: S,
    clock: C,
    timeout: Duration,
    verify_checksum: bool,
}

impl<S: ByteSource> FrameDecoder<S, SystemClock> {
    pub fn new(source: S) -> Self {
        Self::with_clock(source, SystemClock)
    }
}

impl<S: ByteSource, C: Clock> FrameDecoder<S, C> {
    pub fn with_clock(source: S, clock: C) -> Self {
        Self {
            source,
            clock,
            timeout: DEFAULT_FRAME_TIMEOUT,
            verify_checksum: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Off by default: the trailing byte is read but not trusted.
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Reads until one complete frame is decoded or `timeout` runs out.
    ///
    /// Each call starts unsynchronized; a frame cut short by the deadline is
    /// dropped and the next call hunts for a fresh header.
    pub fn next_frame(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RawFrame, SensorError> {
        let deadline = self.clock.now() + timeout;
        let mut sync = FrameSync::new();
        let mut buf = [0u8; FRAME_LEN];

        loop {
            if cancel.is_cancelled() {
                return Err(SensorError::Absent);
            }
            let now = self.clock.now();
            if now >= deadline {
                return Err(SensorError::Absent);
            }

            let available = self.source.bytes_available()?;
            if available == 0 {
                self.clock.sleep(POLL_INTERVAL.min(deadline - now));
                continue;
            }

            let want = sync.bytes_wanted().min(available);
            let n = self.source.read_bytes(&mut buf[..want])?;
            if n == 0 {
                self.clock.sleep(POLL_INTERVAL.min(deadline - now));
                continue;
            }

            for &byte in &buf[..n] {
                let Some(frame) = sync.push(byte) else {
                    continue;
                };
                if self.verify_checksum {
                    let calculated = frame_checksum(&frame);
                    let expected = frame[FRAME_LEN - 1];
                    if calculated != expected {
                        log_debug!(
                            "tf-luna: {}",
                            SensorError::Checksum {
                                expected,
                                calculated
                            }
                        );
                        continue;
                    }
                }
                return Ok(decode_frame(&frame));
            }
        }
    }
}

impl<S, C> Sensor for FrameDecoder<S, C>
where
    S: ByteSource + 'static,
    C: Clock + 'static,
{
    type Reading = Option<RawFrame>;

    fn name(&self) -> &'static str {
        "tf-luna"
    }

    fn acquire(&mut self, cancel: &CancellationToken) -> Option<RawFrame> {
        if let Err(err) = self.source.discard_pending() {
            log_debug!("tf-luna: could not discard stale input: {err}");
        }

        match self.next_frame(self.timeout, cancel) {
            Ok(frame) => Some(frame),
            Err(SensorError::Absent) => {
                log_debug!("tf-luna: no frame within {:?}", self.timeout);
                None
            }
            Err(err) => {
                log_warn!("tf-luna: read failed: {err}");
                None
            }
        }
    }
}
