use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "channel-gain",
    version,
    about = "Measure channel gain between two LOG-a-TEC testbed nodes"
)]
pub struct Cli {
    /// Experiment configuration (TOML). Defaults to $CHANNEL_GAIN_CONFIG or ./channel-gain.toml
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the estimate as JSON instead of text
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Directory for the rolling log file
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
}
