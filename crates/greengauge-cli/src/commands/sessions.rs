use std::path::Path;

use serde::Serialize;

use greengauge_core::{
    EmissionFactor, PipelineConfig, SessionAggregate, SessionId, SessionPipeline, SessionStatus,
    SessionStore,
};

#[derive(Serialize)]
struct Row {
    #[serde(flatten)]
    aggregate: SessionAggregate,
    emission_value: Option<f64>,
}

fn rows(store: &dyn SessionStore, pending_only: bool) -> Result<Vec<Row>, String> {
    let aggregates = if pending_only {
        store.pending_aggregates()
    } else {
        store.aggregates()
    }
    .map_err(|e| e.to_string())?;

    aggregates
        .into_iter()
        .map(|aggregate| {
            let emission = store
                .emission_for(aggregate.session_id)
                .map_err(|e| e.to_string())?;
            Ok(Row {
                emission_value: emission.map(|r| r.emission_value),
                aggregate,
            })
        })
        .collect()
}

/// List stored sessions.
pub fn run(data: &str, pending_only: bool, json: bool) {
    let store = super::open_store(Some(Path::new(data)));
    let rows = rows(store.as_ref(), pending_only).unwrap_or_else(|e| super::fail(e));

    if json {
        match serde_json::to_string_pretty(&rows) {
            Ok(s) => println!("{s}"),
            Err(e) => super::fail(e),
        }
        return;
    }

    if rows.is_empty() {
        println!("No sessions in {data}");
        return;
    }

    println!(
        "{:>6} {:>7} {:>5} {:>10} {:>10} {:>12} {:>9}",
        "ID", "DEVICE", "USER", "POWER W", "ELAPSED s", "EMISSION kg", "STATUS"
    );
    println!("{}", "-".repeat(65));
    for row in &rows {
        let a = &row.aggregate;
        let emission = row
            .emission_value
            .map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
        let status = match a.status {
            SessionStatus::Pending => "pending",
            SessionStatus::Complete => "complete",
        };
        println!(
            "{:>6} {:>7} {:>5} {:>10.3} {:>10.3} {:>12} {:>9}",
            a.session_id.0, a.device_id.0, a.user_id.0, a.avg_power, a.elapsed_seconds, emission, status
        );
    }

    let pending = rows
        .iter()
        .filter(|r| r.aggregate.status == SessionStatus::Pending)
        .count();
    if pending > 0 {
        println!();
        println!("{pending} pending; finish with: greengauge resume <ID> --ef <factor>");
    }
}

/// Finish a pending session.
pub fn resume(data: &str, session_id: u64, ef: f64) {
    let factor = EmissionFactor::new(ef).unwrap_or_else(|e| super::fail(e));
    let store = super::open_store(Some(Path::new(data)));
    let pipeline =
        SessionPipeline::new(store, PipelineConfig::default()).unwrap_or_else(|e| super::fail(e));

    match pipeline.resume_session(SessionId(session_id), factor) {
        Ok(summary) => {
            println!("Session {} complete", summary.session_id);
            println!("  avg power: {:.3} W", summary.avg_power);
            println!("  elapsed:   {:.3} s", summary.elapsed_seconds);
            println!("  emission:  {:.3} kg CO2e", summary.emission_value);
        }
        Err(e) => super::fail(e),
    }
}
