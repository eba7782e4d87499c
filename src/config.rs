use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::devices::NodeId;
use crate::power::GainConvention;

pub const DEFAULT_CONFIG_FILE: &str = "channel-gain.toml";
pub const CONFIG_PATH_ENV: &str = "CHANNEL_GAIN_CONFIG";
pub const USERNAME_ENV: &str = "ALH_USERNAME";
pub const PASSWORD_ENV: &str = "ALH_PASSWORD";
pub const CREDENTIALS_FILE: &str = ".alhrc";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no credentials: set ALH_USERNAME and ALH_PASSWORD or create ~/.alhrc")]
    MissingCredentials,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub testbed: TestbedConfig,
    pub experiment: ChannelGainConfig,
    pub timing: TimingConfig,
}

/// Where the ALH communicator lives.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestbedConfig {
    pub url: String,
    pub cluster: u16,
    pub request_timeout_s: u64,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            url: "https://crn.log-a-tec.eu/communicator".to_string(),
            cluster: 9501,
            request_timeout_s: 30,
        }
    }
}

impl TestbedConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

/// Configuration for a channel gain measurement between two nodes
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelGainConfig {
    pub transmitter: u16,              // node address of the signal generator
    pub receiver: u16,                 // node address of the spectrum sensor
    pub frequency_hz: f64,             // centre frequency of the measurement
    pub bandwidth_hz: f64,             // sensing bandwidth
    pub tx_power_dbm: f64,             // constant transmit power
    pub gain_convention: GainConvention,
    pub output_dir: PathBuf,           // where the run record is written
}

impl Default for ChannelGainConfig {
    fn default() -> Self {
        Self {
            transmitter: 51,
            receiver: 53,
            frequency_hz: 2425e6,
            bandwidth_hz: 400e3,
            tx_power_dbm: 0.0,
            gain_convention: GainConvention::Decibel,
            output_dir: PathBuf::from("logs"),
        }
    }
}

/// Scheduling of the node programs, in seconds.
///
/// Generator offsets count from when its program is sent. Sensing offsets
/// count from the same moment while a transmission is scheduled, so a slow
/// round trip to the coordinator eats into the sensing delay instead of
/// pushing sensing past the end of the transmission.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub tx_delay_s: u32,
    pub tx_duration_s: u32,
    pub sense_delay_s: u32,
    pub sense_duration_s: u32,
    pub clock_skew_s: u32, // node clocks are not synchronised
    pub poll_interval_s: u64,
    pub max_wait_s: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tx_delay_s: 1,
            tx_duration_s: 14,
            sense_delay_s: 3,
            sense_duration_s: 10,
            clock_skew_s: 1,
            poll_interval_s: 2,
            max_wait_s: 60,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_s)
    }

    /// End of the transmission window, counted from the generator program.
    pub fn tx_end_s(&self) -> u32 {
        self.tx_delay_s + self.tx_duration_s
    }

    pub fn validate(&self) -> Result<()> {
        if self.sense_duration_s == 0 {
            return Err(ConfigError::Invalid("sense_duration_s must be positive".into()));
        }
        if self.sense_delay_s < self.tx_delay_s + self.clock_skew_s {
            return Err(ConfigError::Invalid(format!(
                "sensing must start at least clock_skew_s after the transmitter \
                 (sense_delay_s >= {})",
                self.tx_delay_s + self.clock_skew_s
            )));
        }
        let tx_end = self.tx_end_s();
        let sense_end = self.sense_delay_s + self.sense_duration_s + self.clock_skew_s;
        if tx_end < sense_end {
            return Err(ConfigError::Invalid(format!(
                "transmission ends at {tx_end} s but sensing needs it until {sense_end} s"
            )));
        }
        if self.poll_interval_s == 0 {
            return Err(ConfigError::Invalid("poll_interval_s must be positive".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load the configuration from `path`. A missing file at the default
    /// location falls back to built-in defaults.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if !explicit && !path.exists() {
            info!("No configuration at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<()> {
        let exp = &self.experiment;
        if exp.transmitter == exp.receiver {
            return Err(ConfigError::Invalid(format!(
                "transmitter and receiver are the same node ({})",
                exp.transmitter
            )));
        }
        if !exp.tx_power_dbm.is_finite() {
            return Err(ConfigError::Invalid("tx_power_dbm must be a finite number".into()));
        }
        if exp.tx_power_dbm.fract() != 0.0 {
            return Err(ConfigError::Invalid(format!(
                "tx_power_dbm must be a whole number of dBm, got {}",
                exp.tx_power_dbm
            )));
        }
        if !(exp.frequency_hz.is_finite() && exp.frequency_hz > 0.0) {
            return Err(ConfigError::Invalid("frequency_hz must be positive".into()));
        }
        if !(exp.bandwidth_hz.is_finite() && exp.bandwidth_hz > 0.0) {
            return Err(ConfigError::Invalid("bandwidth_hz must be positive".into()));
        }
        if self.testbed.url.trim().is_empty() {
            return Err(ConfigError::Invalid("testbed url is empty".into()));
        }
        self.timing.validate()
    }

    pub fn transmitter(&self) -> NodeId {
        NodeId::new(self.testbed.cluster, self.experiment.transmitter)
    }

    pub fn receiver(&self) -> NodeId {
        NodeId::new(self.testbed.cluster, self.experiment.receiver)
    }
}

/// `--config`, then the environment, then the working directory.
/// The flag tells whether the path was chosen explicitly.
pub fn resolve_config_path(
    cli_path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> (PathBuf, bool) {
    if let Some(path) = cli_path {
        return (path, true);
    }
    match env(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => (PathBuf::from(path), true),
        _ => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    }
}

/// Login for the testbed communicator.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Environment first, then `~/.alhrc`.
    pub fn load(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let (Some(username), Some(password)) = (env(USERNAME_ENV), env(PASSWORD_ENV)) {
            info!("Using testbed credentials from the environment");
            return Ok(Credentials { username, password });
        }

        let home = env("HOME").ok_or(ConfigError::MissingCredentials)?;
        let path = Path::new(&home).join(CREDENTIALS_FILE);
        if !path.exists() {
            return Err(ConfigError::MissingCredentials);
        }
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let credentials = Self::parse_alhrc(&text).ok_or(ConfigError::MissingCredentials)?;
        info!("Using testbed credentials from {}", path.display());
        Ok(credentials)
    }

    /// `Username: ...` and `Password: ...` lines; keys are case-insensitive.
    pub fn parse_alhrc(text: &str) -> Option<Self> {
        let mut username = None;
        let mut password = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "username" => username = Some(value),
                "password" => password = Some(value),
                _ => {}
            }
        }
        Some(Credentials {
            username: username?,
            password: password?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_describe_the_campus_cluster_experiment() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.transmitter(), NodeId::new(9501, 51));
        assert_eq!(config.receiver(), NodeId::new(9501, 53));
        assert_eq!(config.experiment.frequency_hz, 2425e6);
        assert_eq!(config.experiment.tx_power_dbm, 0.0);
        assert_eq!(config.experiment.gain_convention, GainConvention::Decibel);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let config = Config::from_toml(
            r#"
            [testbed]
            cluster = 9002

            [experiment]
            transmitter = 17
            receiver = 19
            tx_power_dbm = -10.0
            gain_convention = "linear_noise_subtracted"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.transmitter(), NodeId::new(9002, 17));
        assert_eq!(config.experiment.tx_power_dbm, -10.0);
        assert_eq!(config.experiment.gain_convention, GainConvention::LinearNoiseSubtracted);
        assert_eq!(config.testbed.url, TestbedConfig::default().url);
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn example_file_matches_the_defaults() {
        let config = Config::from_toml(include_str!("../channel-gain.example.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn same_node_on_both_ends_is_rejected() {
        let mut config = Config::default();
        config.experiment.receiver = config.experiment.transmitter;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn transmission_must_cover_sensing() {
        let mut timing = TimingConfig::default();
        timing.tx_duration_s = 5;
        let err = timing.validate().unwrap_err();
        assert!(err.to_string().contains("transmission ends"));

        let mut timing = TimingConfig::default();
        timing.sense_delay_s = timing.tx_delay_s;
        assert!(timing.validate().is_err());

        // sensing plus clock skew has to end before the transmitter stops
        let mut timing = TimingConfig::default();
        timing.sense_duration_s = 12;
        assert!(timing.validate().is_err());
        timing.clock_skew_s = 0;
        timing.validate().unwrap();
    }

    #[test]
    fn fractional_power_is_rejected() {
        let mut config = Config::default();
        config.experiment.tx_power_dbm = -7.6;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("whole number of dBm"), "{err}");

        config.experiment.tx_power_dbm = -8.0;
        config.validate().unwrap();
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        assert_eq!(Config::load(&path, false).unwrap(), Config::default());
        assert!(matches!(Config::load(&path, true), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn config_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gain.toml");
        fs::write(&path, "[experiment]\nreceiver = 54\n").unwrap();
        assert_eq!(Config::load(&path, true).unwrap().experiment.receiver, 54);

        fs::write(&path, "[experiment]\nreceiver = \"x\"\n").unwrap();
        assert!(matches!(Config::load(&path, true), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn config_path_prefers_flag_then_environment() {
        let env = env_from(&[(CONFIG_PATH_ENV, "/etc/gain.toml")]);
        assert_eq!(
            resolve_config_path(Some("mine.toml".into()), &env),
            (PathBuf::from("mine.toml"), true)
        );
        assert_eq!(resolve_config_path(None, &env), (PathBuf::from("/etc/gain.toml"), true));
        assert_eq!(
            resolve_config_path(None, env_from(&[])),
            (PathBuf::from(DEFAULT_CONFIG_FILE), false)
        );
    }

    #[test]
    fn credentials_come_from_the_environment_first() {
        let env = env_from(&[(USERNAME_ENV, "alice"), (PASSWORD_ENV, "s3cret"), ("HOME", "/nonexistent")]);
        let credentials = Credentials::load(env).unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn credentials_fall_back_to_alhrc() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join(CREDENTIALS_FILE), "Username: bob\nPassword: hunter2\n").unwrap();
        let home_str = home.path().to_str().unwrap().to_string();
        let credentials = Credentials::load(env_from(&[("HOME", home_str.as_str())])).unwrap();
        assert_eq!(credentials.username, "bob");
        assert_eq!(credentials.password, "hunter2");
    }

    #[test]
    fn missing_credentials_are_reported() {
        let home = tempfile::tempdir().unwrap();
        let home_str = home.path().to_str().unwrap().to_string();
        let err = Credentials::load(env_from(&[("HOME", home_str.as_str())])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredentials));
        assert!(Credentials::parse_alhrc("Username: only-user\n").is_none());
    }

    #[test]
    fn debug_output_hides_the_password() {
        let credentials = Credentials {
            username: "alice".into(),
            password: "s3cret".into(),
        };
        let shown = format!("{credentials:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("s3cret"));
    }
}
