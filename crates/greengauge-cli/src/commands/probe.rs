use std::time::Instant;

use greengauge_core::{DeviceId, HttpTelemetrySource, PollStatus, TelemetrySource};

pub fn run(endpoint: &str, device_id: u64, timeout: &str) {
    let timeout = super::parse_duration(timeout).unwrap_or_else(|e| super::fail(e));
    let source = HttpTelemetrySource::new(DeviceId(device_id), endpoint, Some(timeout))
        .unwrap_or_else(|e| super::fail(e));

    println!("Probing: {endpoint}");
    let t0 = Instant::now();
    let status = super::runtime().block_on(source.read());
    let elapsed = t0.elapsed();

    match status {
        PollStatus::Connected { data } => {
            println!("  Voltage: {:>10.3} V", data.voltage);
            println!("  Current: {:>10.3} A", data.current);
            println!("  Power:   {:>10.3} W", data.power);
            println!("  Energy:  {:>10.4} kWh", data.energy);
            println!("  Time:    {:>10.3} s", elapsed.as_secs_f64());
        }
        PollStatus::Error { message } => {
            eprintln!("  {message}");
            std::process::exit(1);
        }
    }
}
