//! Voltage Meter daemon
//!
//! Polls the configured meter and logs every measurement.
//!
//! Usage: meterd [--config meter.toml] [--mock] [--once]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use voltage_meter::{
    logging, AcquisitionScheduler, MeterConfig, MeterResult, TracingSink, TransportMode,
};

/// Three-phase power meter acquisition daemon
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(long, short, env = "METER_CONFIG")]
    config: Option<PathBuf>,

    /// Simulate the meter instead of connecting to it
    #[clap(long)]
    mock: bool,

    /// Run a single sweep, print the report as JSON and exit
    #[clap(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("meterd: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> MeterResult<()> {
    let mut config = MeterConfig::load(args.config.as_deref())?;
    if args.mock {
        config.mode = TransportMode::Mock;
    }
    logging::init(&config.logging)?;
    info!("{}", voltage_meter::info());

    let scheduler = AcquisitionScheduler::from_config(&config, Arc::new(TracingSink::new()))?;
    let connection = scheduler.connection();

    if let Err(e) = connection.connect().await {
        warn!("Initial connection to {} failed: {}", connection.endpoint(), e);
        connection.schedule_reconnect();
    }

    if args.once {
        let report = scheduler.trigger_once().await;
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
        return scheduler.stop().await;
    }

    scheduler.start(config.poll_interval())?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    scheduler.stop().await
}
