pub mod data;

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use csv::Writer;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Credentials};
use crate::devices::{NodeId, TestbedClient, TestbedError};
use crate::power::GainConvention;
pub use data::{ChannelGainEstimate, MeasurementRecord, PowerSample};

/// Readings outside this range mean the sensor is misbehaving, not that the
/// channel is unusual.
pub const MIN_PLAUSIBLE_DBM: f64 = -174.0;
pub const MAX_PLAUSIBLE_DBM: f64 = 30.0;

/// Step of a run, used to tell the user what failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Authentication,
    NoiseMeasurement,
    TransmissionStart,
    SignalMeasurement,
    Cleanup,
    GainComputation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Authentication => "authentication",
            Phase::NoiseMeasurement => "noise measurement",
            Phase::TransmissionStart => "transmission start",
            Phase::SignalMeasurement => "signal measurement",
            Phase::Cleanup => "cleanup",
            Phase::GainComputation => "gain computation",
        };
        f.write_str(name)
    }
}

/// Where a run is between authentication and the transmitter-off command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    Idle,
    NoiseSampled,
    Transmitting,
    SignalSampled,
}

impl MeasurementState {
    /// Which sample may be taken now: noise before the transmitter is on,
    /// signal while it is.
    pub fn sampling_phase(self) -> Option<Phase> {
        match self {
            MeasurementState::Idle => Some(Phase::NoiseMeasurement),
            MeasurementState::Transmitting => Some(Phase::SignalMeasurement),
            MeasurementState::NoiseSampled | MeasurementState::SignalSampled => None,
        }
    }

    /// Every state may return to `Idle`; otherwise steps go strictly in order.
    pub fn can_advance_to(self, next: MeasurementState) -> bool {
        use MeasurementState::*;
        matches!(
            (self, next),
            (_, Idle) | (Idle, NoiseSampled) | (NoiseSampled, Transmitting) | (Transmitting, SignalSampled)
        )
    }
}

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("{phase} failed: {source}")]
    Testbed {
        phase: Phase,
        #[source]
        source: TestbedError,
    },

    #[error("{phase} produced an invalid measurement: {reason}")]
    MeasurementInvalid { phase: Phase, reason: String },

    #[error("invalid experiment parameters: {0}")]
    InvalidParameters(String),
}

impl ExperimentError {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            ExperimentError::Testbed { phase, .. } | ExperimentError::MeasurementInvalid { phase, .. } => {
                Some(*phase)
            }
            ExperimentError::InvalidParameters(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

// A client that refuses to measure under the current conditions has not
// failed to talk to the testbed.
fn testbed_error(phase: Phase, source: TestbedError) -> ExperimentError {
    match source {
        TestbedError::InvalidMeasurement(reason) => ExperimentError::MeasurementInvalid { phase, reason },
        source => ExperimentError::Testbed { phase, source },
    }
}

/// Run a channel gain measurement between the nodes named in the configuration
pub fn run_channel_gain<C: TestbedClient>(
    client: &mut C,
    credentials: &Credentials,
    config: &Config,
) -> Result<ChannelGainEstimate> {
    info!("Starting channel gain measurement with configuration: {:?}", config.experiment);
    run_experiment(
        client,
        credentials,
        &config.receiver(),
        &config.transmitter(),
        config.experiment.tx_power_dbm,
        config.experiment.gain_convention,
    )
}

/// Measure noise with the transmitter silent, then signal with it on, and
/// combine the two into a gain estimate.
///
/// Once authentication succeeds the transmitter is commanded off exactly
/// once before returning, whatever happened in between.
pub fn run_experiment<C: TestbedClient>(
    client: &mut C,
    credentials: &Credentials,
    receiver: &NodeId,
    transmitter: &NodeId,
    tx_power_dbm: f64,
    convention: GainConvention,
) -> Result<ChannelGainEstimate> {
    if !tx_power_dbm.is_finite() {
        return Err(ExperimentError::InvalidParameters(format!(
            "transmit power {tx_power_dbm} dBm is not a number"
        )));
    }
    if receiver == transmitter {
        return Err(ExperimentError::InvalidParameters(format!(
            "node {receiver} can not both transmit and receive"
        )));
    }

    info!("Authenticating with the testbed");
    let session = client.authenticate(credentials).map_err(|source| {
        error!("Authentication failed: {}", source);
        testbed_error(Phase::Authentication, source)
    })?;

    let mut state = MeasurementState::Idle;
    let outcome = measure(client, &session, receiver, transmitter, tx_power_dbm, &mut state);

    // A failed transmit-on may still have reached the node, so this runs on every path.
    info!("Turning transmitter {} off", transmitter);
    let cleanup = client.set_transmit_state(&session, transmitter, false, tx_power_dbm);
    advance(&mut state, MeasurementState::Idle);

    let (noise, signal) = match (outcome, cleanup) {
        (Ok(samples), Ok(())) => samples,
        (Ok(_), Err(source)) => {
            error!("Failed to turn transmitter {} off: {}", transmitter, source);
            return Err(testbed_error(Phase::Cleanup, source));
        }
        (Err(e), Ok(())) => return Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!("Failed to turn transmitter {} off after {}: {}", transmitter, e, cleanup_err);
            return Err(e);
        }
    };

    let gain_db = convention
        .channel_gain(noise.dbm, signal.dbm, tx_power_dbm)
        .map_err(|reason| {
            error!("Gain is undefined: {}", reason);
            ExperimentError::MeasurementInvalid {
                phase: Phase::GainComputation,
                reason,
            }
        })?;

    info!(
        "Channel gain {} -> {}: {:.1} dB ({})",
        transmitter,
        receiver,
        gain_db,
        convention.as_str()
    );

    Ok(ChannelGainEstimate {
        receiver: *receiver,
        transmitter: *transmitter,
        tx_power_dbm,
        noise,
        signal,
        gain_db,
        convention,
    })
}

fn measure<C: TestbedClient>(
    client: &mut C,
    session: &C::Session,
    receiver: &NodeId,
    transmitter: &NodeId,
    tx_power_dbm: f64,
    state: &mut MeasurementState,
) -> Result<(PowerSample, PowerSample)> {
    // The transmitter has not been programmed in this run yet.
    info!("Sampling noise power on {}", receiver);
    let noise = sample(client, session, receiver, *state)?;
    advance(state, MeasurementState::NoiseSampled);

    info!("Starting transmission on {} at {} dBm", transmitter, tx_power_dbm);
    client
        .set_transmit_state(session, transmitter, true, tx_power_dbm)
        .map_err(|source| {
            error!("Failed to start transmission on {}: {}", transmitter, source);
            testbed_error(Phase::TransmissionStart, source)
        })?;
    advance(state, MeasurementState::Transmitting);

    info!("Sampling signal power on {}", receiver);
    let signal = sample(client, session, receiver, *state)?;
    advance(state, MeasurementState::SignalSampled);

    Ok((noise, signal))
}

fn sample<C: TestbedClient>(
    client: &mut C,
    session: &C::Session,
    node: &NodeId,
    state: MeasurementState,
) -> Result<PowerSample> {
    let phase = state.sampling_phase().ok_or_else(|| {
        ExperimentError::InvalidParameters(format!("no sample is due in state {state:?}"))
    })?;
    let dbm = client.sample_power(session, node).map_err(|source| {
        error!("{} on {} failed: {}", phase, node, source);
        testbed_error(phase, source)
    })?;

    if !dbm.is_finite() || !(MIN_PLAUSIBLE_DBM..=MAX_PLAUSIBLE_DBM).contains(&dbm) {
        error!("{} on {} returned implausible {} dBm", phase, node, dbm);
        return Err(ExperimentError::MeasurementInvalid {
            phase,
            reason: format!(
                "{dbm} dBm from {node} is outside [{MIN_PLAUSIBLE_DBM}, {MAX_PLAUSIBLE_DBM}] dBm"
            ),
        });
    }

    let sample = PowerSample::new(dbm, client.last_sweep_stats());
    info!("{} on {}: {}", phase, node, sample.summary());
    Ok(sample)
}

fn advance(state: &mut MeasurementState, next: MeasurementState) {
    debug_assert!(state.can_advance_to(next), "{state:?} -> {next:?}");
    debug!("Measurement state {:?} -> {:?}", state, next);
    *state = next;
}

/// Save the run record to a timestamped CSV file in `dir`
pub fn save_measurement_to_csv(dir: &Path, record: &MeasurementRecord) -> io::Result<PathBuf> {
    let file_name = chrono::Local::now()
        .format("channel_gain_%Y-%m-%d_%H-%M-%S.csv")
        .to_string();

    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);

    let file = File::create(&path)?;
    let mut writer = Writer::from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;

    info!("Measurement saved to {}", path.display());
    Ok(path)
}

/// Write the run record for a finished measurement. The measurement stands
/// on its own, so a record that can not be written is only a warning.
pub fn record_run(dir: &Path, estimate: &ChannelGainEstimate, frequency_hz: f64) -> Option<PathBuf> {
    let record = MeasurementRecord::new(estimate, frequency_hz);
    match save_measurement_to_csv(dir, &record) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Could not write the run record to {}: {}", dir.display(), e);
            None
        }
    }
}
