//! End-to-End Test Runner

use anyhow::Result;
use clap::Parser;
use e2e_tests::ping_pong;
use engine::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of pings to send
    #[arg(short, long, default_value_t = 1000)]
    count: u64,

    /// Id of the first ping
    #[arg(long, default_value_t = 9876)]
    first_id: u64,

    /// Scenario timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Engine configuration environment (loads config/<env>.toml overlays)
    #[arg(short, long)]
    environment: Option<String>,

    /// Write the JSON report to a file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("e2e_tests={}", log_level).parse()?)
                .add_directive(format!("engine={}", log_level).parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting e2e runner v{}", env!("CARGO_PKG_VERSION"));

    let config = match engine_config::load_config(args.environment.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration, using defaults");
            EngineConfig::default()
        }
    };

    let report = ping_pong(
        config,
        args.first_id,
        args.count,
        Duration::from_secs(args.timeout),
    )?;
    let json = serde_json::to_string_pretty(&report)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }

    if report.pongs_received != report.pings_sent || report.duplicate_pongs > 0 {
        error!("Scenario failed");
        std::process::exit(1);
    }
    Ok(())
}
