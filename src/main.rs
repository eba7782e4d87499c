mod cli;
mod config;
mod devices;
mod experiment;
mod power;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt};

use cli::Cli;
use config::{Config, Credentials};
use devices::{AlhWeb, VesnaTestbed};
use experiment::ChannelGainEstimate;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging; the guard flushes the log file when main returns
    let _guard = setup_logging(&cli.log_dir);
    info!("Starting channel gain measurement");

    match run(&cli) {
        Ok(()) => {
            info!("Application shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Experiment failed: {}", e);
            eprintln!("Experiment failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let env = |key: &str| std::env::var(key).ok();

    let (config_path, explicit) = config::resolve_config_path(cli.config.clone(), env);
    let config = Config::load(&config_path, explicit)?;
    let credentials = Credentials::load(env)?;

    let alh = AlhWeb::new(&config.testbed.url, config.testbed.cluster, config.testbed.request_timeout())?;
    let mut testbed = VesnaTestbed::new(
        alh,
        config.experiment.frequency_hz,
        config.experiment.bandwidth_hz,
        config.timing.clone(),
    );

    let estimate = experiment::run_channel_gain(&mut testbed, &credentials, &config)?;
    report(&estimate, cli.json)?;

    let output_dir = &config.experiment.output_dir;
    match experiment::record_run(output_dir, &estimate, config.experiment.frequency_hz) {
        Some(path) => info!("Experiment completed successfully. Results saved to: {}", path.display()),
        None => {
            warn!("Experiment completed without a run record");
            eprintln!(
                "Measurement succeeded, but the run record could not be written to {}",
                output_dir.display()
            );
        }
    }
    Ok(())
}

fn report(estimate: &ChannelGainEstimate, json: bool) -> serde_json::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(estimate)?);
    } else {
        println!("p_noise = {}", estimate.noise.summary());
        println!("p_rx    = {}", estimate.signal.summary());
        println!("h = {:.1} dB", estimate.gain_db);
    }
    Ok(())
}

fn setup_logging(log_dir: &Path) -> WorkerGuard {
    // Set up file-based logging with daily rotation
    let file_appender = rolling::daily(log_dir, "channel-gain.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .init();

    guard
}
