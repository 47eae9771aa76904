//! Raw meter readings and the buffered samples built from them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ids::DeviceId;

/// One instantaneous read of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    /// RMS voltage, volts.
    pub voltage: f64,
    /// RMS current, amperes.
    pub current: f64,
    /// Active power, watts.
    pub power: f64,
    /// Energy counter, kWh.
    pub energy: f64,
}

impl Readings {
    /// Reject non-finite or negative fields.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("voltage", self.voltage),
            ("current", self.current),
            ("power", self.power),
            ("energy", self.energy),
        ] {
            if !value.is_finite() {
                return Err(PipelineError::validation(field, "must be a finite number"));
            }
            if value < 0.0 {
                return Err(PipelineError::validation(field, "must not be negative"));
            }
        }
        Ok(())
    }
}

/// A reading captured inside an open session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: DeviceId,
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub energy: f64,
    /// Capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

impl Sample {
    pub fn new(device_id: DeviceId, readings: Readings, captured_at_ms: u64) -> Self {
        Self {
            device_id,
            current: readings.current,
            voltage: readings.voltage,
            power: readings.power,
            energy: readings.energy,
            captured_at_ms,
        }
    }

    pub fn readings(&self) -> Readings {
        Readings {
            voltage: self.voltage,
            current: self.current,
            power: self.power,
            energy: self.energy,
        }
    }
}

/// Wall-clock now in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
