//! `greengauge record`: poll one plug for a session and store the result.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use greengauge_core::{
    DeviceId, EmissionFactor, HttpTelemetrySource, PipelineConfig, PipelineError,
    SessionPipeline, UserId,
};

pub struct RecordConfig<'a> {
    pub endpoint: &'a str,
    pub device_id: u64,
    pub user_id: u64,
    pub ef: Option<f64>,
    pub country: Option<&'a str>,
    pub reference: Option<&'a str>,
    pub duration: Option<&'a str>,
    pub interval: &'a str,
    pub timeout: Option<&'a str>,
    pub data: &'a str,
}

fn resolve_factor(cfg: &RecordConfig<'_>) -> Result<EmissionFactor, String> {
    match (cfg.ef, cfg.country) {
        (Some(ef), _) => EmissionFactor::new(ef).map_err(|e| e.to_string()),
        (None, Some(country)) => super::load_reference(cfg.reference.map(Path::new))
            .require_factor(country)
            .map_err(|e| e.to_string()),
        (None, None) => Err("pass --ef or --country with --reference".to_string()),
    }
}

fn pipeline_config(interval: Duration, timeout: Option<Duration>) -> PipelineConfig {
    PipelineConfig {
        poll_interval_ms: interval.as_millis() as u64,
        request_timeout_ms: timeout.map(|t| t.as_millis() as u64),
        ..PipelineConfig::default()
    }
}

/// Run the record command.
pub fn run(cfg: RecordConfig<'_>) {
    let factor = resolve_factor(&cfg).unwrap_or_else(|e| super::fail(e));
    let interval = super::parse_duration(cfg.interval).unwrap_or_else(|e| super::fail(e));
    let max_duration = cfg
        .duration
        .map(|d| super::parse_duration(d).unwrap_or_else(|e| super::fail(e)));

    let timeout = cfg
        .timeout
        .map(|t| super::parse_duration(t).unwrap_or_else(|e| super::fail(e)));

    let pipeline_config = pipeline_config(interval, timeout);
    let request_timeout = pipeline_config.request_timeout();
    let store = super::open_store(Some(Path::new(cfg.data)));
    let pipeline = SessionPipeline::new(store, pipeline_config).unwrap_or_else(|e| super::fail(e));

    // Ctrl+C ends the session early; the close sequence still runs.
    let stop = CancellationToken::new();
    let handler_token = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        super::fail(format!("cannot install Ctrl+C handler: {e}"));
    }

    let device_id = DeviceId(cfg.device_id);
    let user_id = UserId(cfg.user_id);
    let source = HttpTelemetrySource::new(device_id, cfg.endpoint, request_timeout)
        .unwrap_or_else(|e| super::fail(e));

    println!("Recording {device_id} from {}", cfg.endpoint);
    println!("  interval: {interval:?}");
    if let Some(t) = request_timeout {
        println!("  timeout:  {t:?}");
    }
    match max_duration {
        Some(d) => println!("  duration: {d:?} (Ctrl+C to stop early)"),
        None => println!("  duration: until Ctrl+C"),
    }
    println!("  store:    {}", cfg.data);
    println!();

    let rt = super::runtime();
    let result = rt.block_on(async {
        let key = pipeline.open_polled_session(source, user_id)?;
        let started = Instant::now();
        match max_duration {
            Some(d) => {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(d) => {}
                }
            }
            None => stop.cancelled().await,
        }
        println!(
            "Stopping after {:.1}s, {} samples buffered",
            started.elapsed().as_secs_f64(),
            pipeline.buffered(key).map_or(0, |s| s.len())
        );
        pipeline.close_session(key, factor).await
    });

    match result {
        Ok(summary) => {
            println!();
            println!("Session {} stored", summary.session_id);
            println!("  samples:   {}", summary.sample_count.unwrap_or_default());
            println!("  elapsed:   {:.3} s", summary.elapsed_seconds);
            println!("  avg power: {:.3} W", summary.avg_power);
            println!("  avg volt:  {:.3} V", summary.avg_voltage);
            println!("  avg amp:   {:.3} A", summary.avg_current);
            println!("  emission:  {:.3} kg CO2e (EF {})", summary.emission_value, factor.value());
        }
        Err(PipelineError::Incomplete { session_id, source }) => {
            eprintln!("Session {session_id} was stored but its emission was not: {source}");
            eprintln!("Finish it with: greengauge resume {session_id} --ef <factor> --data {}", cfg.data);
            std::process::exit(1);
        }
        Err(PipelineError::NoData(_)) => {
            super::fail("no samples were collected; nothing was stored");
        }
        Err(e) => super::fail(e),
    }
}
