//! Session aggregate statistics.
//!
//! On close, the pipeline reduces a session's samples to arithmetic means of
//! the four readings plus the wall-clock duration between start and stop.
//! Duration comes from the session clock, not from sample timestamps.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ids::{DeviceId, SessionId, SessionKey, UserId};
use crate::sample::Sample;

/// Decimal places used for averages and elapsed time when not configured.
pub const DEFAULT_PRECISION: u32 = 3;

/// Round half away from zero to `places` decimal places.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Mean statistics of one closed session, before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub avg_current: f64,
    pub avg_voltage: f64,
    pub avg_power: f64,
    pub avg_energy: f64,
    pub elapsed_seconds: f64,
    pub sample_count: usize,
}

/// Reduce `samples` to rounded means.
///
/// An empty sample set is [`PipelineError::NoData`]; no mean is computed.
pub fn summarize(
    key: SessionKey,
    samples: &[Sample],
    started_at_ms: u64,
    stopped_at_ms: u64,
    precision: u32,
) -> Result<AggregateStats> {
    if samples.is_empty() {
        return Err(PipelineError::NoData(key));
    }
    let n = samples.len() as f64;
    let (mut current, mut voltage, mut power, mut energy) = (0.0, 0.0, 0.0, 0.0);
    for s in samples {
        current += s.current;
        voltage += s.voltage;
        power += s.power;
        energy += s.energy;
    }
    let elapsed_ms = stopped_at_ms.saturating_sub(started_at_ms);
    Ok(AggregateStats {
        avg_current: round_to(current / n, precision),
        avg_voltage: round_to(voltage / n, precision),
        avg_power: round_to(power / n, precision),
        avg_energy: round_to(energy / n, precision),
        elapsed_seconds: round_to(elapsed_ms as f64 / 1000.0, precision),
        sample_count: samples.len(),
    })
}

/// Completion state of a persisted session.
///
/// An aggregate is written `Pending` and flipped to `Complete` only after its
/// emission record exists, so a failure between the two writes stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Complete,
}

/// Aggregate as submitted to the store, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAggregate {
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub avg_current: f64,
    pub avg_voltage: f64,
    pub avg_power: f64,
    pub avg_energy: f64,
    pub elapsed_seconds: f64,
}

impl NewAggregate {
    pub fn from_stats(device_id: DeviceId, user_id: UserId, stats: &AggregateStats) -> Self {
        Self {
            device_id,
            user_id,
            avg_current: stats.avg_current,
            avg_voltage: stats.avg_voltage,
            avg_power: stats.avg_power,
            avg_energy: stats.avg_energy,
            elapsed_seconds: stats.elapsed_seconds,
        }
    }

    /// Reject non-finite or negative fields. Used for aggregates submitted
    /// from outside the pipeline.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("avg_current", self.avg_current),
            ("avg_voltage", self.avg_voltage),
            ("avg_power", self.avg_power),
            ("avg_energy", self.avg_energy),
            ("elapsed_seconds", self.elapsed_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::validation(
                    field,
                    "must be a finite, non-negative number",
                ));
            }
        }
        Ok(())
    }
}

/// One persisted, immutable session aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregate {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub avg_current: f64,
    pub avg_voltage: f64,
    pub avg_power: f64,
    pub avg_energy: f64,
    pub elapsed_seconds: f64,
    pub created_at_ms: u64,
    pub status: SessionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Readings;

    fn sample(current: f64, voltage: f64, power: f64, energy: f64, at: u64) -> Sample {
        Sample::new(
            DeviceId(1),
            Readings {
                voltage,
                current,
                power,
                energy,
            },
            at,
        )
    }

    // -----------------------------------------------------------------------
    // round_to
    // -----------------------------------------------------------------------

    #[test]
    fn test_round_to_three_places() {
        assert_eq!(round_to(1.23456, 3), 1.235);
        assert_eq!(round_to(2.0004, 3), 2.0);
        assert_eq!(round_to(0.1 + 0.2, 3), 0.3);
    }

    #[test]
    fn test_round_to_zero_places() {
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
    }

    // -----------------------------------------------------------------------
    // summarize
    // -----------------------------------------------------------------------

    #[test]
    fn test_means_over_exactly_the_samples() {
        let samples = vec![
            sample(0.5, 230.0, 100.0, 0.010, 0),
            sample(0.6, 231.0, 140.0, 0.020, 5_000),
            sample(0.7, 229.0, 210.0, 0.033, 10_000),
        ];
        let stats = summarize(SessionKey::new(), &samples, 0, 15_000, 3).unwrap();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.avg_current, 0.6);
        assert_eq!(stats.avg_voltage, 230.0);
        assert_eq!(stats.avg_power, 150.0);
        assert_eq!(stats.avg_energy, 0.021);
        assert_eq!(stats.elapsed_seconds, 15.0);
    }

    #[test]
    fn test_means_are_rounded() {
        let samples = vec![
            sample(1.0, 1.0, 1.0, 1.0, 0),
            sample(1.0, 1.0, 1.0, 1.0, 0),
            sample(2.0, 2.0, 2.0, 2.0, 0),
        ];
        let stats = summarize(SessionKey::new(), &samples, 0, 0, 3).unwrap();
        assert_eq!(stats.avg_power, 1.333);
    }

    #[test]
    fn test_elapsed_is_wall_clock_not_sample_span() {
        let samples = vec![sample(1.0, 1.0, 1.0, 1.0, 50_000)];
        let stats = summarize(SessionKey::new(), &samples, 10_000, 12_345, 3).unwrap();
        assert_eq!(stats.elapsed_seconds, 2.345);
    }

    #[test]
    fn test_elapsed_saturates_when_clock_steps_back() {
        let samples = vec![sample(1.0, 1.0, 1.0, 1.0, 0)];
        let stats = summarize(SessionKey::new(), &samples, 10_000, 9_000, 3).unwrap();
        assert_eq!(stats.elapsed_seconds, 0.0);
    }

    #[test]
    fn test_empty_sample_set_is_no_data() {
        let key = SessionKey::new();
        assert!(matches!(
            summarize(key, &[], 0, 1_000, 3),
            Err(PipelineError::NoData(k)) if k == key
        ));
    }

    // -----------------------------------------------------------------------
    // NewAggregate validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_aggregate_rejects_negative_elapsed() {
        let agg = NewAggregate {
            device_id: DeviceId(1),
            user_id: UserId(1),
            avg_current: 0.5,
            avg_voltage: 230.0,
            avg_power: 100.0,
            avg_energy: 0.1,
            elapsed_seconds: -1.0,
        };
        assert!(matches!(
            agg.validate(),
            Err(PipelineError::Validation {
                field: "elapsed_seconds",
                ..
            })
        ));
    }
}
