use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::devices::NodeId;
use crate::power::{GainConvention, SweepStats};

/// A received power reading, stamped when the testbed returned it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    pub dbm: f64,
    pub taken_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SweepStats>, // spread of the sweep behind `dbm`
}

impl PowerSample {
    pub fn new(dbm: f64, stats: Option<SweepStats>) -> Self {
        Self {
            dbm,
            taken_at: Utc::now(),
            stats,
        }
    }

    /// `-90.0 dBm (mean=1e-9 mW std=0e0 mW)`, or just the power
    /// when there is no sweep behind it.
    pub fn summary(&self) -> String {
        match self.stats {
            Some(stats) => format!(
                "{:.1} dBm (mean={:e} mW std={:e} mW)",
                self.dbm, stats.mean_mw, stats.std_mw
            ),
            None => format!("{:.1} dBm", self.dbm),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelGainEstimate {
    pub receiver: NodeId,
    pub transmitter: NodeId,
    pub tx_power_dbm: f64,
    pub noise: PowerSample,
    pub signal: PowerSample,
    pub gain_db: f64,
    pub convention: GainConvention,
}

#[derive(Serialize)]
pub struct MeasurementRecord {
    pub timestamp: String, // UTC ISO timestamp
    pub transmitter: String,
    pub receiver: String,
    pub frequency_hz: f64,
    #[serde(rename = "tx_power_dBm")]
    pub tx_power_dbm: f64,
    #[serde(rename = "noise_dBm")]
    pub noise_dbm: f64,
    #[serde(rename = "signal_dBm")]
    pub signal_dbm: f64,
    #[serde(rename = "gain_dB")]
    pub gain_db: f64,
    pub convention: &'static str,
}

impl MeasurementRecord {
    pub fn new(estimate: &ChannelGainEstimate, frequency_hz: f64) -> Self {
        Self {
            timestamp: estimate.signal.taken_at.to_rfc3339(),
            transmitter: estimate.transmitter.to_string(),
            receiver: estimate.receiver.to_string(),
            frequency_hz,
            tx_power_dbm: estimate.tx_power_dbm,
            noise_dbm: estimate.noise.dbm,
            signal_dbm: estimate.signal.dbm,
            gain_db: estimate.gain_db,
            convention: estimate.convention.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_shows_the_sweep_in_milliwatts() {
        let stats = SweepStats {
            mean_mw: 1e-9,
            std_mw: 2.5e-10,
            samples: 4,
        };
        assert_eq!(
            PowerSample::new(-90.0, Some(stats)).summary(),
            "-90.0 dBm (mean=1e-9 mW std=2.5e-10 mW)"
        );
        assert_eq!(PowerSample::new(-90.04, None).summary(), "-90.0 dBm");
    }

    #[test]
    fn sweep_stats_appear_in_json_only_when_present() {
        let stats = SweepStats {
            mean_mw: 1e-9,
            std_mw: 0.0,
            samples: 2,
        };
        let with = serde_json::to_value(PowerSample::new(-90.0, Some(stats))).unwrap();
        assert_eq!(with["stats"]["samples"], 2);
        let without = serde_json::to_value(PowerSample::new(-90.0, None)).unwrap();
        assert!(without.get("stats").is_none());
    }
}
