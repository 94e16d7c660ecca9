//! MLX90614 infrared thermometer over SMBus.

use tokio_util::sync::CancellationToken;

use crate::models::TemperatureReading;

use super::{RegisterBus, Sensor, SensorError};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

pub const DEFAULT_ADDRESS: u8 = 0x5A;
pub const REG_AMBIENT: u8 = 0x06;
pub const REG_OBJECT: u8 = 0x07;

/// Datasheet transfer function: 0.02 K per LSB, shifted to Celsius.
///
/// Computed in hundredths (`raw * 2 - 27315`) so the 2-decimal result is
/// exact rather than rounded from a float product.
pub fn raw_to_celsius(raw: u16) -> f64 {
    let centi = i32::from(raw) * 2 - 27_315;
    f64::from(centi) / 100.0
}

pub struct RegisterTempReader<B> {
    bus: B,
    address: u8,
}

impl<B: RegisterBus> RegisterTempReader<B> {
    pub fn new(bus: B) -> Self {
        Self::with_address(bus, DEFAULT_ADDRESS)
    }

    pub fn with_address(bus: B, address: u8) -> Self {
        Self { bus, address }
    }

    /// Reads ambient and object registers independently; no retries.
    pub fn read(&mut self) -> TemperatureReading {
        TemperatureReading {
            ambient_c: self.read_celsius(REG_AMBIENT, "ambient"),
            object_c: self.read_celsius(REG_OBJECT, "object"),
        }
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }

    /// One register, converted. Errors are returned rather than logged.
    pub fn read_register(&mut self, register: u8) -> Result<f64, SensorError> {
        self.bus
            .read_register16(self.address, register)
            .map(raw_to_celsius)
    }

    /// Ambient then object; the first bus error aborts the pair.
    pub fn try_read(&mut self) -> Result<(f64, f64), SensorError> {
        let ambient = self.read_register(REG_AMBIENT)?;
        let object = self.read_register(REG_OBJECT)?;
        Ok((ambient, object))
    }

    fn read_celsius(&mut self, register: u8, label: &str) -> Option<f64> {
        match self.read_register(register) {
            Ok(celsius) => Some(celsius),
            Err(err) => {
                log_warn!(
                    "mlx90614: {label} register {register:#04x} at {:#04x} failed: {err}",
                    self.address
                );
                None
            }
        }
    }
}

impl<B: RegisterBus + 'static> Sensor for RegisterTempReader<B> {
    type Reading = TemperatureReading;

    fn name(&self) -> &'static str {
        "mlx90614"
    }

    /// Two short bus transactions; nothing to interrupt.
    fn acquire(&mut self, _cancel: &CancellationToken) -> TemperatureReading {
        self.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockBus {
        registers: HashMap<u8, Result<u16, ()>>,
        reads: Vec<(u8, u8)>,
    }

    impl RegisterBus for MockBus {
        fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, SensorError> {
            self.reads.push((address, register));
            match self.registers.get(&register) {
                Some(Ok(raw)) => Ok(*raw),
                Some(Err(())) => Err(SensorError::Bus("nack".into())),
                None => Err(SensorError::Bus("no such register".into())),
            }
        }
    }

    fn bus(ambient: Result<u16, ()>, object: Result<u16, ()>) -> MockBus {
        MockBus {
            registers: HashMap::from([(REG_AMBIENT, ambient), (REG_OBJECT, object)]),
            reads: Vec::new(),
        }
    }

    #[test]
    fn conversion_is_exact_to_two_decimals() {
        assert_eq!(raw_to_celsius(13_658), 0.01);
        assert_eq!(raw_to_celsius(13_657), -0.01);
        assert_eq!(raw_to_celsius(15_000), 26.85);
        assert_eq!(raw_to_celsius(16_158), 50.01);
        assert_eq!(raw_to_celsius(0), -273.15);
        assert_eq!(raw_to_celsius(u16::MAX), 1037.55);
    }

    #[test]
    fn conversion_matches_float_formula_after_rounding() {
        for raw in [0u16, 1, 7_500, 13_657, 14_908, 15_000, 29_815, 40_000, u16::MAX] {
            let float = f64::from(raw) * 0.02 - 273.15;
            let rounded = (float * 100.0).round() / 100.0;
            assert_eq!(raw_to_celsius(raw), rounded, "raw {raw}");
        }
    }

    #[test]
    fn reads_both_registers_at_device_address() {
        let mut reader = RegisterTempReader::new(bus(Ok(14_908), Ok(15_000)));
        let reading = reader.read();

        assert_eq!(reading.ambient_c, Some(25.01));
        assert_eq!(reading.object_c, Some(26.85));
        assert!(reading.is_complete());
        assert_eq!(
            reader.bus.reads,
            vec![(DEFAULT_ADDRESS, REG_AMBIENT), (DEFAULT_ADDRESS, REG_OBJECT)]
        );
    }

    #[test]
    fn ambient_failure_keeps_object_value() {
        let mut reader = RegisterTempReader::new(bus(Err(()), Ok(15_000)));
        let reading = reader.read();

        assert_eq!(reading.ambient_c, None);
        assert_eq!(reading.object_c, Some(26.85));
        assert!(!reading.is_complete());
    }

    #[test]
    fn object_failure_keeps_ambient_value() {
        let mut reader = RegisterTempReader::new(bus(Ok(14_908), Err(())));
        let reading = reader.read();

        assert_eq!(reading.ambient_c, Some(25.01));
        assert_eq!(reading.object_c, None);
    }

    #[test]
    fn strict_read_stops_at_first_failure() {
        let mut reader = RegisterTempReader::new(bus(Err(()), Ok(15_000)));
        assert!(matches!(reader.try_read(), Err(SensorError::Bus(_))));
        assert_eq!(reader.bus.reads, vec![(DEFAULT_ADDRESS, REG_AMBIENT)]);

        let mut reader = RegisterTempReader::new(bus(Ok(14_908), Ok(15_000)));
        assert_eq!(reader.try_read().unwrap(), (25.01, 26.85));
    }

    #[test]
    fn dead_bus_yields_absent_reading() {
        let mut reader = RegisterTempReader::with_address(MockBus::default(), 0x5B);
        let reading = reader.acquire(&CancellationToken::new());

        assert!(reading.is_absent());
        assert_eq!(reader.bus.reads, vec![(0x5B, REG_AMBIENT), (0x5B, REG_OBJECT)]);
    }
}
