//! Smart-plug status page over HTTP.
//!
//! The plug firmware serves a small text/HTML page with labelled readings
//! (`Vrms: 229.8`, `Irms: 0.51`, ...). Each read is one `GET`; network
//! failures, non-success statuses and parse failures all collapse into
//! [`PollStatus::Error`].

use std::time::Duration;

use reqwest::Client;

use crate::error::{PipelineError, Result};
use crate::ids::DeviceId;
use crate::source::{PollStatus, TelemetrySource, parse_status_page};

/// Reads one device's status page.
#[derive(Clone)]
pub struct HttpTelemetrySource {
    client: Client,
    endpoint: String,
    device_id: DeviceId,
    timeout: Option<Duration>,
}

impl HttpTelemetrySource {
    /// Build a source for `endpoint`. A `timeout` of `None` leaves reads
    /// unbounded.
    pub fn new(
        device_id: DeviceId,
        endpoint: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let client = builder
            .build()
            .map_err(|e| PipelineError::upstream("device", format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            device_id,
            timeout,
        })
    }

    /// Request timeout the client was built with.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self) -> Result<String, String> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {e}", self.endpoint))?;
        if !response.status().is_success() {
            return Err(format!("{} answered {}", self.endpoint, response.status()));
        }
        response
            .text()
            .await
            .map_err(|e| format!("reading body from {} failed: {e}", self.endpoint))
    }
}

impl TelemetrySource for HttpTelemetrySource {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    async fn read(&self) -> PollStatus {
        let body = match self.fetch().await {
            Ok(body) => body,
            Err(message) => return PollStatus::error(message),
        };
        match parse_status_page(&body) {
            Ok(readings) => PollStatus::connected(readings),
            Err(e) => PollStatus::error(e.to_string()),
        }
    }
}
