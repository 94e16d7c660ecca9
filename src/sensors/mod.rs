//! Sensor acquisition layer.
//!
//! Each physical device is driven by a reader that exclusively owns its
//! port or bus handle for the process lifetime. Readers never fail a cycle:
//! whatever goes wrong inside them is logged and turned into an absent value.

pub mod clock;
pub mod hal;
pub mod ld6002;
pub mod mlx90614;
pub mod tf_luna;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ld6002::WindowedByteSampler;
pub use mlx90614::RegisterTempReader;
pub use tf_luna::FrameDecoder;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Upper bound on a single "nothing to read yet" wait.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The reader produced nothing this cycle. Normal.
    SensorAbsent,
    /// Port or bus level failure. Handled like an absence by the scheduler.
    TransportFault,
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// No data arrived before the deadline, or shutdown interrupted the read.
    #[error("no data before deadline")]
    Absent,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("checksum mismatch: expected {expected:#04x}, calculated {calculated:#04x}")]
    Checksum { expected: u8, calculated: u8 },
}

impl SensorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SensorError::Absent => ErrorKind::SensorAbsent,
            SensorError::Io(_) | SensorError::Bus(_) | SensorError::Checksum { .. } => {
                ErrorKind::TransportFault
            }
        }
    }
}

/// A serial stream that can be polled without blocking indefinitely.
pub trait ByteSource: Send {
    /// Number of bytes that can be read right now.
    fn bytes_available(&mut self) -> Result<usize, SensorError>;

    /// Reads up to `buf.len()` bytes. A read timeout is reported as `Ok(0)`.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, SensorError>;

    /// Drops whatever the OS buffered since the last cycle.
    fn discard_pending(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    fn bytes_available(&mut self) -> Result<usize, SensorError> {
        (**self).bytes_available()
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
        (**self).read_bytes(buf)
    }

    fn discard_pending(&mut self) -> Result<(), SensorError> {
        (**self).discard_pending()
    }
}

/// A register-addressed bus such as SMBus/I2C.
pub trait RegisterBus: Send {
    fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, SensorError>;
}

impl<T: RegisterBus + ?Sized> RegisterBus for Box<T> {
    fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, SensorError> {
        (**self).read_register16(address, register)
    }
}

/// One acquisition per cycle. Runs on a blocking thread; implementations
/// must bound every wait and return early once `cancel` fires.
pub trait Sensor: Send {
    type Reading: Send + 'static;

    fn name(&self) -> &'static str;

    fn acquire(&mut self, cancel: &CancellationToken) -> Self::Reading;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    type Reading = S::Reading;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn acquire(&mut self, cancel: &CancellationToken) -> Self::Reading {
        (**self).acquire(cancel)
    }
}
