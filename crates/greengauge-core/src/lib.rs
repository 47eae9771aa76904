//! # greengauge-core
//!
//! **Measure what a device burns, and what it cost to build.**
//!
//! `greengauge-core` samples smart-plug power meters over HTTP, groups the
//! samples into monitoring sessions, reduces each closed session to an
//! aggregate, and records the session's usage emission against the id the
//! store assigned to that aggregate. Manufacturing emissions and a per-user
//! leaderboard come from a device catalogue.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use greengauge_core::{
//!     DeviceId, EmissionFactor, HttpTelemetrySource, MemoryStore, PipelineConfig,
//!     SessionPipeline, UserId,
//! };
//!
//! # async fn run() -> greengauge_core::Result<()> {
//! let pipeline = SessionPipeline::new(Arc::new(MemoryStore::new()), PipelineConfig::default())?;
//! let plug = HttpTelemetrySource::new(DeviceId(1), "http://192.168.1.40/", None)?;
//! let key = pipeline.open_polled_session(plug, UserId(1))?;
//!
//! tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//! let summary = pipeline.close_session(key, EmissionFactor::new(0.296)?).await?;
//! println!("session {} emitted {} kg CO2e", summary.session_id, summary.emission_value);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Source → Buffer (per session) → Aggregate → Store → Emission
//!
//! Every meter implements the [`TelemetrySource`] trait. The
//! [`SessionPipeline`] owns the buffer and the poll tasks and drives the
//! close sequence; persistence sits behind [`SessionStore`].

pub mod aggregate;
pub mod buffer;
pub mod config;
pub mod correlate;
pub mod emissions;
pub mod error;
pub mod forecast;
pub mod ids;
pub mod leaderboard;
pub mod pipeline;
pub mod reference;
pub mod sample;
pub mod source;
pub mod sources;
pub mod store;

pub use aggregate::{
    AggregateStats, DEFAULT_PRECISION, NewAggregate, SessionAggregate, SessionStatus, round_to,
    summarize,
};
pub use buffer::SampleBuffer;
pub use config::PipelineConfig;
pub use correlate::{SeriesPoint, attach_emission, correlated_series, latest_session};
pub use emissions::{
    EmissionFactor, EmissionRecord, ManufacturingEmissionProfile, UsageEstimate, estimate_usage,
    manufacturing_emission, usage_emission,
};
pub use error::{PipelineError, Result, StoreError};
pub use forecast::{Forecast, ForecastClient, ForecastPoint, forecast_for};
pub use ids::{DeviceId, SessionId, SessionKey, UserId};
pub use leaderboard::{LeaderboardEntry, leaderboard};
pub use pipeline::{OpenSession, SessionPipeline, SessionSummary};
pub use reference::{CatalogEntry, DeviceCatalog, EmissionFactorTable, ReferenceData};
pub use sample::{Readings, Sample, now_ms};
pub use source::{PollStatus, TelemetrySource, parse_status_page};
pub use sources::{HttpTelemetrySource, ScriptedSource};
pub use store::{Device, FileStore, MemoryStore, NewDevice, SessionStore, StoreSnapshot, User};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
