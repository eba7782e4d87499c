//! Power unit conversions and the arithmetic behind a channel gain estimate.

use serde::{Deserialize, Serialize};

pub fn db_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

pub fn mw_to_db(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Summary of one sensing sweep. Averaging happens in the linear domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepStats {
    pub mean_mw: f64,
    pub std_mw: f64,
    pub samples: usize,
}

impl SweepStats {
    pub fn from_dbm(samples_dbm: &[f64]) -> Option<Self> {
        if samples_dbm.is_empty() {
            return None;
        }
        let n = samples_dbm.len() as f64;
        let linear: Vec<f64> = samples_dbm.iter().map(|&p| db_to_mw(p)).collect();
        let mean_mw = linear.iter().sum::<f64>() / n;
        // population deviation, like numpy.std
        let variance = linear.iter().map(|p| (p - mean_mw).powi(2)).sum::<f64>() / n;
        Some(SweepStats {
            mean_mw,
            std_mw: variance.sqrt(),
            samples: samples_dbm.len(),
        })
    }

    pub fn mean_dbm(&self) -> f64 {
        mw_to_db(self.mean_mw)
    }
}

/// How the noise, signal and transmit power are combined into a gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GainConvention {
    /// `signal - noise - tx_power`, all in dB.
    #[default]
    Decibel,
    /// `(signal_mw - noise_mw) / tx_mw`, converted back to dB.
    LinearNoiseSubtracted,
}

impl GainConvention {
    pub fn channel_gain(self, noise_dbm: f64, signal_dbm: f64, tx_power_dbm: f64) -> Result<f64, String> {
        match self {
            GainConvention::Decibel => Ok(signal_dbm - noise_dbm - tx_power_dbm),
            GainConvention::LinearNoiseSubtracted => {
                let received_mw = db_to_mw(signal_dbm) - db_to_mw(noise_dbm);
                if received_mw <= 0.0 {
                    return Err(format!(
                        "signal power {signal_dbm:.1} dBm is not above noise power {noise_dbm:.1} dBm"
                    ));
                }
                Ok(mw_to_db(received_mw / db_to_mw(tx_power_dbm)))
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GainConvention::Decibel => "decibel",
            GainConvention::LinearNoiseSubtracted => "linear_noise_subtracted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn conversions_are_inverse() {
        assert!(close(db_to_mw(0.0), 1.0));
        assert!(close(db_to_mw(-30.0), 0.001));
        assert!(close(mw_to_db(100.0), 20.0));
        assert!(close(mw_to_db(db_to_mw(-87.3)), -87.3));
    }

    #[test]
    fn decibel_gain_is_plain_subtraction() {
        let gain = GainConvention::Decibel.channel_gain(-90.0, -50.0, 10.0).unwrap();
        assert_eq!(gain, 30.0);
    }

    #[test]
    fn linear_gain_removes_noise_before_dividing_by_tx_power() {
        // 2 mW received over 1 mW noise, 1 mW transmitted -> 1 mW / 1 mW = 0 dB
        let signal = mw_to_db(2.0);
        let gain = GainConvention::LinearNoiseSubtracted
            .channel_gain(0.0, signal, 0.0)
            .unwrap();
        assert!(close(gain, 0.0), "gain = {gain}");

        let gain = GainConvention::LinearNoiseSubtracted
            .channel_gain(-100.0, -50.0, 0.0)
            .unwrap();
        assert!((gain - -50.0).abs() < 1e-3, "gain = {gain}");
    }

    #[test]
    fn linear_gain_needs_signal_above_noise() {
        let err = GainConvention::LinearNoiseSubtracted
            .channel_gain(-60.0, -60.0, 0.0)
            .unwrap_err();
        assert!(err.contains("not above noise"));
    }

    #[test]
    fn sweep_statistics_average_in_milliwatts() {
        let stats = SweepStats::from_dbm(&[0.0, mw_to_db(3.0)]).unwrap();
        assert_eq!(stats.samples, 2);
        assert!(close(stats.mean_mw, 2.0));
        assert!(close(stats.std_mw, 1.0));
        assert!(close(stats.mean_dbm(), mw_to_db(2.0)));
    }

    #[test]
    fn empty_sweep_has_no_statistics() {
        assert!(SweepStats::from_dbm(&[]).is_none());
    }

    #[test]
    fn convention_names_match_config_values() {
        let parsed: GainConvention = serde_json::from_str("\"linear_noise_subtracted\"").unwrap();
        assert_eq!(parsed, GainConvention::LinearNoiseSubtracted);
        assert_eq!(GainConvention::default().as_str(), "decibel");
    }
}
