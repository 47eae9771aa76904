//! Carbon-emission derivations.
//!
//! Two independent figures are computed:
//! - **Usage emission** for one measured session:
//!   `avg_power (W) × elapsed_seconds × factor (kg‑CO2e/kWh) × 0.001`.
//! - **Manufacturing emission** for a device, once, from its catalogue entry:
//!   `lifetime_years × gwp_total`.
//!
//! A third, manual estimate mirrors the "calculate emissions" form of the
//! device page: `power_kw × hours × factor`.

use serde::{Deserialize, Serialize};

use crate::aggregate::round_to;
use crate::error::{PipelineError, Result};
use crate::ids::{DeviceId, SessionId, UserId};

/// Scale applied by the usage formula.
pub const USAGE_SCALE: f64 = 0.001;

/// Grid carbon intensity, kg‑CO2e per kWh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct EmissionFactor(f64);

impl EmissionFactor {
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(PipelineError::validation(
                "emission_factor",
                "must be a finite, non-negative number",
            ));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for EmissionFactor {
    type Error = PipelineError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EmissionFactor> for f64 {
    fn from(f: EmissionFactor) -> Self {
        f.0
    }
}

/// Usage emission of a session, unrounded.
pub fn usage_emission(avg_power: f64, elapsed_seconds: f64, factor: EmissionFactor) -> f64 {
    avg_power * elapsed_seconds * factor.value() * USAGE_SCALE
}

/// Embodied emission of a device: `lifetime_years × gwp_total`, exact.
pub fn manufacturing_emission(lifetime_years: f64, gwp_total: f64) -> Result<f64> {
    if !lifetime_years.is_finite() || lifetime_years < 0.0 {
        return Err(PipelineError::validation(
            "lifetime_years",
            "must be a finite, non-negative number",
        ));
    }
    if !gwp_total.is_finite() || gwp_total < 0.0 {
        return Err(PipelineError::validation(
            "gwp_total",
            "must be a finite, non-negative number",
        ));
    }
    Ok(lifetime_years * gwp_total)
}

/// Emission record correlated to exactly one session aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub emission_value: f64,
}

impl EmissionRecord {
    pub fn validate(&self) -> Result<()> {
        if !self.emission_value.is_finite() || self.emission_value < 0.0 {
            return Err(PipelineError::validation(
                "emission_value",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// Manufacturing emission stored on a device record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManufacturingEmissionProfile {
    pub device_id: DeviceId,
    pub lifetime_years: f64,
    pub gwp_total: f64,
    pub manufacturing_emission: f64,
}

impl ManufacturingEmissionProfile {
    pub fn compute(device_id: DeviceId, lifetime_years: f64, gwp_total: f64) -> Result<Self> {
        Ok(Self {
            device_id,
            lifetime_years,
            gwp_total,
            manufacturing_emission: manufacturing_emission(lifetime_years, gwp_total)?,
        })
    }
}

/// A manually entered consumption estimate, not tied to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEstimate {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub power_kw: f64,
    /// Duration in hours, rounded to three places.
    pub hours: f64,
    pub emission: f64,
}

/// Estimate the emission of running at `power_kw` for `hours` and `minutes`.
///
/// Zero total duration is rejected, as is a non-positive power.
pub fn estimate_usage(
    device_id: DeviceId,
    user_id: UserId,
    power_kw: f64,
    hours: f64,
    minutes: f64,
    factor: EmissionFactor,
) -> Result<UsageEstimate> {
    if !power_kw.is_finite() || power_kw <= 0.0 {
        return Err(PipelineError::validation("power_kw", "must be a positive number"));
    }
    if !hours.is_finite() || hours < 0.0 || !minutes.is_finite() || minutes < 0.0 {
        return Err(PipelineError::validation(
            "duration",
            "hours and minutes must be non-negative",
        ));
    }
    let duration_h = hours + minutes / 60.0;
    if duration_h == 0.0 {
        return Err(PipelineError::validation("duration", "must be longer than zero"));
    }
    let energy_kwh = power_kw * duration_h;
    Ok(UsageEstimate {
        device_id,
        user_id,
        power_kw,
        hours: round_to(duration_h, 3),
        emission: round_to(energy_kwh * factor.value(), 3),
    })
}
