//! Field telemetry collaborators
//!
//! The sampling stack and the irrigation actuator live outside the core; the
//! supervisor consumes them through [`SensorSource`] and [`ActuatorSink`].
//! What crosses the boundary is the packed application payloads:
//!
//!   sensor reading:    soil(2,LE) | temp(2,LE) | humidity(2,LE)
//!                    | battery(2,LE) | status(1)           — FPort 1 uplink
//!   irrigation command: zone(1) | duration(2,LE) | priority(1) — FPort 2 downlink
//!
//! Scaled integers throughout: volumetric water content, temperature and
//! relative humidity ×100, battery in millivolts.

use tracing::info;

/// Application port for sensor uplinks.
pub const SENSOR_PORT: u8 = 1;
/// Application port for irrigation command downlinks.
pub const IRRIGATION_PORT: u8 = 2;

pub const SENSOR_READING_LEN: usize = 9;
pub const IRRIGATION_COMMAND_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    /// Soil volumetric water content × 100.
    pub soil_moisture: u16,
    /// Air temperature in °C × 100.
    pub temperature: i16,
    /// Relative humidity × 100.
    pub humidity: u16,
    /// Battery level in mV.
    pub battery_mv: u16,
    /// Sensor status flags.
    pub status: u8,
}

impl SensorReading {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SENSOR_READING_LEN);
        bytes.extend_from_slice(&self.soil_moisture.to_le_bytes());
        bytes.extend_from_slice(&self.temperature.to_le_bytes());
        bytes.extend_from_slice(&self.humidity.to_le_bytes());
        bytes.extend_from_slice(&self.battery_mv.to_le_bytes());
        bytes.push(self.status);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SENSOR_READING_LEN {
            return None;
        }
        Some(Self {
            soil_moisture: u16::from_le_bytes([bytes[0], bytes[1]]),
            temperature: i16::from_le_bytes([bytes[2], bytes[3]]),
            humidity: u16::from_le_bytes([bytes[4], bytes[5]]),
            battery_mv: u16::from_le_bytes([bytes[6], bytes[7]]),
            status: bytes[8],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrrigationCommand {
    pub zone: u8,
    pub duration_s: u16,
    pub priority: u8,
}

impl IrrigationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(IRRIGATION_COMMAND_LEN);
        bytes.push(self.zone);
        bytes.extend_from_slice(&self.duration_s.to_le_bytes());
        bytes.push(self.priority);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IRRIGATION_COMMAND_LEN {
            return None;
        }
        Some(Self {
            zone: bytes[0],
            duration_s: u16::from_le_bytes([bytes[1], bytes[2]]),
            priority: bytes[3],
        })
    }
}

/// Supplies one reading per uplink slot; `None` when nothing fresh is
/// available (the slot is skipped, never padded).
pub trait SensorSource: Send {
    fn sample(&mut self) -> Option<SensorReading>;
}

/// Receives decoded irrigation commands from accepted downlinks.
pub trait ActuatorSink: Send {
    fn dispatch(&mut self, command: IrrigationCommand);
}

/// Deterministic stand-in for the sampling stack: a slow moisture ramp with a
/// sagging battery, good enough to drive the pipeline end to end.
#[derive(Debug, Default)]
pub struct SimulatedField {
    counter: u32,
}

impl SensorSource for SimulatedField {
    fn sample(&mut self) -> Option<SensorReading> {
        self.counter += 1;
        Some(SensorReading {
            soil_moisture: 2200 + ((self.counter * 37) % 1500) as u16,
            temperature: 1850 + ((self.counter * 13) % 700) as i16,
            humidity: 5400 + ((self.counter * 29) % 2000) as u16,
            battery_mv: 3600u16.saturating_sub((self.counter / 8) as u16),
            status: 0,
        })
    }
}

/// Default actuator: logs the command. A relay-driver implementation replaces
/// this on irrigation-capable gateways.
#[derive(Debug, Default)]
pub struct LoggingActuator;

impl ActuatorSink for LoggingActuator {
    fn dispatch(&mut self, command: IrrigationCommand) {
        info!(
            zone = command.zone,
            duration_s = command.duration_s,
            priority = command.priority,
            "irrigation command received"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_reading_roundtrip() {
        let reading = SensorReading {
            soil_moisture: 2750,
            temperature: -125,
            humidity: 6100,
            battery_mv: 3412,
            status: 0b0000_0010,
        };
        let bytes = reading.encode();
        assert_eq!(bytes.len(), SENSOR_READING_LEN);
        assert_eq!(SensorReading::decode(&bytes), Some(reading));
    }

    #[test]
    fn test_irrigation_command_roundtrip() {
        let command = IrrigationCommand { zone: 3, duration_s: 900, priority: 1 };
        let bytes = command.encode();
        assert_eq!(bytes.len(), IRRIGATION_COMMAND_LEN);
        assert_eq!(IrrigationCommand::decode(&bytes), Some(command));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(SensorReading::decode(&[0; 8]), None);
        assert_eq!(IrrigationCommand::decode(&[0; 5]), None);
    }

    #[test]
    fn test_simulated_field_always_samples() {
        let mut field = SimulatedField::default();
        let first = field.sample().unwrap();
        let second = field.sample().unwrap();
        assert_ne!(first, second);
    }
}
