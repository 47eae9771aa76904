//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::DEFAULT_PRECISION;
use crate::error::{PipelineError, Result};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_FORECAST_URL: &str = "http://127.0.0.1:10020";

/// Settings shared by every session a pipeline runs.
///
/// Durations are kept in milliseconds so the struct maps directly onto the
/// JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Time between two polls of a device.
    pub poll_interval_ms: u64,
    /// Decimal places for averages, elapsed time and usage emission.
    pub precision: u32,
    /// Per-request timeout for device and forecast calls. `None` waits
    /// indefinitely.
    pub request_timeout_ms: Option<u64>,
    pub forecast_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            precision: DEFAULT_PRECISION,
            request_timeout_ms: None,
            forecast_url: DEFAULT_FORECAST_URL.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::validation(
                "poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.precision > 12 {
            return Err(PipelineError::validation("precision", "at most 12 places"));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(PipelineError::validation(
                "request_timeout_ms",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }
}
