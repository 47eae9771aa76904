//! Telemetry source implementations.

pub mod http;
pub mod scripted;

pub use http::HttpTelemetrySource;
pub use scripted::ScriptedSource;
