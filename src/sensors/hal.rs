//! Adapters from real ports and buses to the reader traits.

use std::{
    io::{self, Read},
    time::Duration,
};

use anyhow::{Context, Result};
use embedded_hal::i2c::I2c;
use serialport::{ClearBuffer, SerialPort};

use super::{ByteSource, RegisterBus, SensorError};

pub struct SerialByteSource {
    port: Box<dyn SerialPort>,
}

impl SerialByteSource {
    /// `read_timeout` bounds a single `read_bytes` call, not a whole frame.
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()
            .with_context(|| format!("failed to open serial port {path} at {baud_rate} baud"))?;
        Ok(Self { port })
    }
}

impl ByteSource for SerialByteSource {
    fn bytes_available(&mut self) -> Result<usize, SensorError> {
        let n = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(n as usize)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn discard_pending(&mut self) -> Result<(), SensorError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|err| SensorError::Io(err.into()))
    }
}

/// SMBus-style 16-bit register reads over an embedded-hal I2C bus:
/// write the register pointer, read two bytes back, low byte first.
pub struct I2cRegisterBus<I> {
    i2c: I,
}

impl<I> I2cRegisterBus<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn into_inner(self) -> I {
        self.i2c
    }
}

impl<I> RegisterBus for I2cRegisterBus<I>
where
    I: I2c + Send,
{
    fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, SensorError> {
        let mut data = [0u8; 2];
        self.i2c
            .write_read(address, &[register], &mut data)
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;
        Ok(u16::from_le_bytes(data))
    }
}
