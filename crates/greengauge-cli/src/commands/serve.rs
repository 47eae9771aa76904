use greengauge_core::SessionPipeline;
use greengauge_server::{AppState, run_server};

use crate::config::{Overrides, ServerConfig};

pub fn run(overrides: Overrides<'_>) {
    let config = ServerConfig::resolve(overrides).unwrap_or_else(|e| super::fail(e));

    let store = super::open_store(config.data.as_deref());
    let reference = super::load_reference(config.reference.as_deref());
    let pipeline = SessionPipeline::new(store, config.pipeline.clone())
        .unwrap_or_else(|e| super::fail(e));

    let base = format!("http://{}:{}", config.host, config.port);
    println!("GreenGauge Server v{}", greengauge_core::VERSION);
    println!("   {base}");
    match &config.data {
        Some(path) => println!("   store: {}", path.display()),
        None => println!("   store: in-memory (pass --data to keep sessions)"),
    }
    println!(
        "   reference: {} countries, {} catalogue entries",
        reference.emission_factors.len(),
        reference.catalog.len()
    );
    println!("   poll interval: {:?}", config.pipeline.poll_interval());
    println!();
    println!("   Endpoints:");
    println!("     GET  /                      API index (try: curl {base})");
    println!("     POST /sessions              Open a session (endpoint → server-side polling)");
    println!("     POST /sessions/{{key}}/close  Close with {{emission_factor}} or {{country}}");
    println!("     GET  /series                Correlated sessions of a device");
    println!("     GET  /leaderboard           Users ranked by manufacturing emission");
    println!("     GET  /health                Liveness");
    println!();

    let state = AppState::new(pipeline, reference).unwrap_or_else(|e| super::fail(e));
    let rt = super::runtime();
    if let Err(e) = rt.block_on(run_server(state, &config.host, config.port)) {
        super::fail(format!("server stopped: {e}"));
    }
}
