//! Client for the external usage-forecasting service.
//!
//! The service takes a device's correlated session history and predicts the
//! next session's average power, duration and emission. It is a black box to
//! this crate; any failure surfaces as [`PipelineError::Upstream`] with
//! `service = "forecast"` and is never retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::correlate::correlated_series;
use crate::error::{PipelineError, Result};
use crate::ids::{DeviceId, UserId};
use crate::store::SessionStore;

const SERVICE: &str = "forecast";

/// One history row as the forecasting service expects it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    #[serde(rename = "avgPower")]
    pub avg_power: f64,
    #[serde(rename = "timeElapsed")]
    pub time_elapsed: f64,
    #[serde(rename = "PCEmissions")]
    pub emission: f64,
}

#[derive(Debug, Serialize)]
struct ForecastRequest<'a> {
    data: &'a [ForecastPoint],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    #[serde(rename = "future_avgPower")]
    pub future_avg_power: f64,
    #[serde(rename = "future_timeElapsed")]
    pub future_time_elapsed: f64,
    #[serde(rename = "future_PCEmissions")]
    pub future_emission: f64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForecastClient {
    client: reqwest::Client,
    base_url: String,
}

impl ForecastClient {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let client = builder.build().map_err(|e| {
            PipelineError::upstream(SERVICE, format!("cannot build HTTP client: {e}"))
        })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submit `points` to `POST {base_url}/predict`.
    pub async fn predict(&self, points: &[ForecastPoint]) -> Result<Forecast> {
        let url = format!("{}/predict", self.base_url);
        log::debug!("requesting forecast over {} points from {url}", points.len());

        let response = self
            .client
            .post(&url)
            .json(&ForecastRequest { data: points })
            .send()
            .await
            .map_err(|e| PipelineError::upstream(SERVICE, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::upstream(SERVICE, e.to_string()))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody {
                    error,
                    details: Some(d),
                }) => format!("{status}: {error} ({d})"),
                Ok(ErrorBody { error, .. }) => format!("{status}: {error}"),
                Err(_) => format!("{status}: {body}"),
            };
            return Err(PipelineError::upstream(SERVICE, detail));
        }

        serde_json::from_str(&body)
            .map_err(|e| PipelineError::upstream(SERVICE, format!("undecodable response: {e}")))
    }
}

/// Forecast the next session of `user`'s `device` from its correlated history.
pub async fn forecast_for(
    store: &dyn SessionStore,
    client: &ForecastClient,
    user: UserId,
    device: DeviceId,
) -> Result<Forecast> {
    let points: Vec<ForecastPoint> = correlated_series(store, user, device)?
        .into_iter()
        .map(|p| ForecastPoint {
            avg_power: p.avg_power,
            time_elapsed: p.elapsed_seconds,
            emission: p.emission_value,
        })
        .collect();
    if points.is_empty() {
        return Err(PipelineError::validation("device_id", "no correlated sessions"));
    }
    client.predict(&points).await
}
