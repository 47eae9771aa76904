//! CLI for GreenGauge: smart-plug sessions turned into carbon figures.

mod commands;
mod config;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "greengauge")]
#[command(about = "greengauge: smart-plug sessions turned into carbon figures")]
#[command(version = greengauge_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// JSON config file; flags below override its values
        #[arg(long)]
        config: Option<String>,

        /// Bind address
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// JSON store file (default: in-memory, lost on exit)
        #[arg(long)]
        data: Option<String>,

        /// Reference data file with emission factors and the device catalogue
        #[arg(long)]
        reference: Option<String>,
    },

    /// Read a smart-plug status page once
    Probe {
        /// Status page URL (e.g. http://192.168.1.40/)
        endpoint: String,

        /// Device id to report the reading under
        #[arg(long, default_value = "0")]
        device_id: u64,

        /// Request timeout (e.g. "5s", "500ms")
        #[arg(long, default_value = "5s")]
        timeout: String,
    },

    /// Poll a smart plug for a session, then store its aggregate and emission
    Record {
        /// Status page URL
        endpoint: String,

        #[arg(long)]
        device_id: u64,

        #[arg(long)]
        user_id: u64,

        /// Grid emission factor in kg CO2e per kWh
        #[arg(long, conflicts_with = "country")]
        ef: Option<f64>,

        /// Country code looked up in the reference file
        #[arg(long, requires = "reference")]
        country: Option<String>,

        /// Reference data file
        #[arg(long)]
        reference: Option<String>,

        /// Session length (e.g. "30s", "5m"); default: until Ctrl+C
        #[arg(long)]
        duration: Option<String>,

        /// Poll interval
        #[arg(long, default_value = "5s")]
        interval: String,

        /// Per-request timeout (e.g. "2s"); default: none
        #[arg(long)]
        timeout: Option<String>,

        /// JSON store file
        #[arg(long, default_value = "greengauge.json")]
        data: String,
    },

    /// List stored session aggregates
    Sessions {
        /// JSON store file
        #[arg(long, default_value = "greengauge.json")]
        data: String,

        /// Only sessions still waiting for their emission record
        #[arg(long)]
        pending: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Complete a pending session
    Resume {
        /// Session id
        session_id: u64,

        /// Grid emission factor in kg CO2e per kWh
        #[arg(long)]
        ef: f64,

        /// JSON store file
        #[arg(long, default_value = "greengauge.json")]
        data: String,
    },

    /// Rank users by the manufacturing emission of their devices
    Leaderboard {
        /// JSON store file
        #[arg(long, default_value = "greengauge.json")]
        data: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            data,
            reference,
        } => commands::serve::run(config::Overrides {
            config: config.as_deref(),
            host,
            port,
            data,
            reference,
        }),
        Commands::Probe {
            endpoint,
            device_id,
            timeout,
        } => commands::probe::run(&endpoint, device_id, &timeout),
        Commands::Record {
            endpoint,
            device_id,
            user_id,
            ef,
            country,
            reference,
            duration,
            interval,
            timeout,
            data,
        } => commands::record::run(commands::record::RecordConfig {
            endpoint: &endpoint,
            device_id,
            user_id,
            ef,
            country: country.as_deref(),
            reference: reference.as_deref(),
            duration: duration.as_deref(),
            interval: &interval,
            timeout: timeout.as_deref(),
            data: &data,
        }),
        Commands::Sessions {
            data,
            pending,
            json,
        } => commands::sessions::run(&data, pending, json),
        Commands::Resume {
            session_id,
            ef,
            data,
        } => commands::sessions::resume(&data, session_id, ef),
        Commands::Leaderboard { data } => commands::leaderboard::run(&data),
    }
}
