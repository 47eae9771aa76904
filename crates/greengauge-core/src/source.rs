//! Telemetry source trait and the status-page parser.
//!
//! A telemetry source is anything that can be asked, once per tick, for the
//! current meter readings of one device. Every source implements the
//! [`TelemetrySource`] trait and reports a [`PollStatus`]: either the four
//! readings or an error string. A source never retries inside a tick; the
//! poll loop's next tick is the retry.

use std::future::Future;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ids::DeviceId;
use crate::sample::Readings;

static VRMS: LazyLock<Regex> = LazyLock::new(|| label_pattern("Vrms"));
static IRMS: LazyLock<Regex> = LazyLock::new(|| label_pattern("Irms"));
static POWER: LazyLock<Regex> = LazyLock::new(|| label_pattern("Power"));
static KWH: LazyLock<Regex> = LazyLock::new(|| label_pattern("kWh"));

fn label_pattern(label: &str) -> Regex {
    Regex::new(&format!(r"{label}:\s*([\d.]+)")).expect("status label pattern is valid")
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    Connected { data: Readings },
    Error { message: String },
}

impl PollStatus {
    pub fn connected(readings: Readings) -> Self {
        Self::Connected { data: readings }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn readings(&self) -> Option<Readings> {
        match self {
            Self::Connected { data } => Some(*data),
            Self::Error { .. } => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Trait every telemetry source implements.
pub trait TelemetrySource: Send + Sync + 'static {
    /// Device whose meter this source reads.
    fn device_id(&self) -> DeviceId;

    /// Perform exactly one read.
    fn read(&self) -> impl Future<Output = PollStatus> + Send;
}

impl<S: TelemetrySource> TelemetrySource for Arc<S> {
    fn device_id(&self) -> DeviceId {
        (**self).device_id()
    }

    fn read(&self) -> impl Future<Output = PollStatus> + Send {
        (**self).read()
    }
}

/// Parse the four labelled numeric fields out of a status page.
///
/// Each label must be followed by a colon and a `[0-9.]+` token. The first
/// occurrence of a label wins. A missing label or an unparsable token is a
/// validation error naming the label.
pub fn parse_status_page(body: &str) -> Result<Readings> {
    let voltage = capture(&VRMS, "Vrms", body)?;
    let current = capture(&IRMS, "Irms", body)?;
    let power = capture(&POWER, "Power", body)?;
    let energy = capture(&KWH, "kWh", body)?;
    Ok(Readings {
        voltage,
        current,
        power,
        energy,
    })
}

fn capture(re: &Regex, label: &'static str, body: &str) -> Result<f64> {
    let token = re
        .captures(body)
        .and_then(|c| c.get(1))
        .ok_or_else(|| PipelineError::validation(label, "label missing from status page"))?;
    token
        .as_str()
        .parse::<f64>()
        .map_err(|_| PipelineError::validation(label, format!("unparsable value '{}'", token.as_str())))
}
