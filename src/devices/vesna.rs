use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::{AlhWeb, NodeId, Result, TestbedClient, TestbedError};
use crate::config::{Credentials, TimingConfig};
use crate::power::SweepStats;

// The sensor stores one program's results per slot; a run only ever needs one.
const SENSING_SLOT: u32 = 1;

/// One hardware configuration of a radio device on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub device: u32,
    pub device_name: String,
    pub config: u32,
    pub name: String,
    pub base_hz: f64,
    pub spacing_hz: f64,
    pub bandwidth_hz: f64,
    pub channels: u32,
    pub time_ms: u32,
    pub min_power_dbm: Option<f64>, // signal generators only
    pub max_power_dbm: Option<f64>,
}

impl DeviceConfig {
    pub fn channel_frequency(&self, channel: u32) -> f64 {
        self.base_hz + channel as f64 * self.spacing_hz
    }

    /// Channel whose centre is nearest to `f_hz`, if `f_hz` falls inside it.
    pub fn channel_for(&self, f_hz: f64) -> Option<u32> {
        if self.spacing_hz <= 0.0 || self.channels == 0 {
            return None;
        }
        let channel = ((f_hz - self.base_hz) / self.spacing_hz).round();
        if channel < 0.0 || channel >= self.channels as f64 {
            return None;
        }
        let channel = channel as u32;
        let offset = (self.channel_frequency(channel) - f_hz).abs();
        (offset <= self.bandwidth_hz / 2.0).then_some(channel)
    }

    fn supports_power(&self, power_dbm: f64) -> bool {
        match (self.min_power_dbm, self.max_power_dbm) {
            (Some(min), Some(max)) => power_dbm >= min && power_dbm <= max,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSelection {
    pub device: u32,
    pub config: u32,
    pub channel: u32,
}

/// Parsed `deviceConfigList` of a signal generator or spectrum sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigList {
    pub configs: Vec<DeviceConfig>,
}

impl ConfigList {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut configs = Vec::new();
        let mut device: Option<(u32, String)> = None;
        let mut config: Option<(u32, String)> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(rest) = line.strip_prefix("dev #") {
                let mut fields = rest.split(',');
                let id = parse_index(fields.next().unwrap_or(""), line)?;
                let name = fields.next().unwrap_or("").trim().to_string();
                device = Some((id, name));
                config = None;
            } else if let Some(rest) = line.strip_prefix("cfg #") {
                let (id, name) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("malformed configuration line: {line}"))?;
                let name = name.trim().trim_end_matches(':').trim().to_string();
                config = Some((parse_index(id, line)?, name));
            } else if line.starts_with("base:") {
                let (device, device_name) = device
                    .clone()
                    .ok_or_else(|| format!("parameters before any device: {line}"))?;
                let (config, name) = config
                    .take()
                    .ok_or_else(|| format!("parameters before any configuration: {line}"))?;
                let params = parse_params(line);
                configs.push(DeviceConfig {
                    device,
                    device_name,
                    config,
                    name,
                    base_hz: required(&params, "base", line)?,
                    spacing_hz: required(&params, "spacing", line)?,
                    bandwidth_hz: required(&params, "bw", line)?,
                    channels: required(&params, "channels", line)? as u32,
                    time_ms: params.get("time").copied().unwrap_or(0.0) as u32,
                    min_power_dbm: params.get("min power").copied(),
                    max_power_dbm: params.get("max power").copied(),
                });
            }
        }

        if configs.is_empty() {
            return Err("no device configurations listed".to_string());
        }
        Ok(ConfigList { configs })
    }

    /// Sensing configuration at least `bandwidth_hz` wide that covers `f_hz`.
    pub fn sweep_config(&self, f_hz: f64, bandwidth_hz: f64) -> Option<ChannelSelection> {
        self.nearest(f_hz, |c| c.bandwidth_hz >= bandwidth_hz * (1.0 - 1e-6))
    }

    /// Transmit configuration that covers `f_hz` and can emit `power_dbm`.
    pub fn tx_config(&self, f_hz: f64, power_dbm: f64) -> Option<ChannelSelection> {
        self.nearest(f_hz, |c| c.supports_power(power_dbm))
    }

    fn nearest(&self, f_hz: f64, accept: impl Fn(&DeviceConfig) -> bool) -> Option<ChannelSelection> {
        self.configs
            .iter()
            .filter(|c| accept(c))
            .filter_map(|c| c.channel_for(f_hz).map(|ch| (c, ch)))
            .min_by(|(a, ach), (b, bch)| {
                let da = (a.channel_frequency(*ach) - f_hz).abs();
                let db = (b.channel_frequency(*bch) - f_hz).abs();
                da.total_cmp(&db)
            })
            .map(|(c, channel)| ChannelSelection {
                device: c.device,
                config: c.config,
                channel,
            })
    }
}

fn parse_index(text: &str, line: &str) -> std::result::Result<u32, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("bad index in line: {line}"))
}

// "base: 2400000000 Hz, spacing: 500000 Hz, ..." -> {"base": 2.4e9, ...}
fn parse_params(line: &str) -> HashMap<String, f64> {
    line.split(',')
        .filter_map(|field| {
            let (key, value) = field.split_once(':')?;
            let value = value.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

fn required(params: &HashMap<String, f64>, key: &str, line: &str) -> std::result::Result<f64, String> {
    params
        .get(key)
        .copied()
        .ok_or_else(|| format!("missing '{key}' in line: {line}"))
}

/// Constant carrier transmission scheduled on a signal generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorProgram {
    pub selection: ChannelSelection,
    pub power_dbm: i32,
    pub delay_s: u32,
    pub duration_s: u32,
}

impl fmt::Display for GeneratorProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "in {} sec for {} sec with dev {} conf {} channel {} power {}",
            self.delay_s,
            self.duration_s,
            self.selection.device,
            self.selection.config,
            self.selection.channel,
            self.power_dbm
        )
    }
}

/// Single-channel power sweep scheduled on a spectrum sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorProgram {
    pub selection: ChannelSelection,
    pub delay_s: u32,
    pub duration_s: u32,
    pub slot: u32,
}

impl fmt::Display for SensorProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = self.selection.channel;
        write!(
            f,
            "in {} sec for {} sec with dev {} conf {} ch {}:1:{} to slot {}",
            self.delay_s,
            self.duration_s,
            self.selection.device,
            self.selection.config,
            ch,
            ch + 1,
            self.slot
        )
    }
}

fn slot_complete(status: &str) -> bool {
    status.contains("status=COMPLETE")
}

/// One line per sweep: `timestamp_ms,p0[,p1...]`. Only the first channel is kept.
pub fn parse_slot_data(text: &str) -> std::result::Result<Vec<f64>, String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut fields = line.split(',').skip(1);
            fields
                .next()
                .and_then(|p| p.trim().parse::<f64>().ok())
                .ok_or_else(|| format!("malformed sweep line: {line}"))
        })
        .collect()
}

/// Seconds the sensor should wait before sweeping.
///
/// Without a transmission the configured delay is used as is. While a
/// transmission is scheduled both windows run on the generator's clock:
/// `since_tx` is the time since its program was sent, so the delay shrinks as
/// that time passes, and the sweep must end (plus clock skew) before the
/// transmission does.
pub fn sensing_delay(timing: &TimingConfig, since_tx: Option<Duration>) -> std::result::Result<u32, String> {
    let Some(since_tx) = since_tx else {
        return Ok(timing.sense_delay_s);
    };
    let elapsed = since_tx.as_secs_f64();
    let delay = (timing.sense_delay_s as f64 - elapsed).max(0.0).ceil();
    let sense_end = elapsed + delay + (timing.sense_duration_s + timing.clock_skew_s) as f64;
    let tx_end = timing.tx_end_s() as f64;
    if sense_end > tx_end {
        return Err(format!(
            "sensing would end {sense_end:.2} s after the generator was programmed, \
             but transmission ends at {tx_end:.0} s"
        ));
    }
    Ok(delay as u32)
}

pub struct AlhSession {
    credentials: Credentials,
}

/// A generator program that has been accepted and not yet stopped.
#[derive(Debug, Clone, Copy)]
struct Transmission {
    node: NodeId,
    programmed_at: Instant,
}

/// LOG-a-TEC nodes with VESNA signal generators and spectrum sensors.
pub struct VesnaTestbed {
    alh: AlhWeb,
    frequency_hz: f64,
    bandwidth_hz: f64,
    timing: TimingConfig,
    // hardware does not change during a run, so each list is fetched once
    generator_configs: HashMap<NodeId, ConfigList>,
    sensor_configs: HashMap<NodeId, ConfigList>,
    transmission: Option<Transmission>,
    last_stats: Option<SweepStats>,
}

impl VesnaTestbed {
    pub fn new(alh: AlhWeb, frequency_hz: f64, bandwidth_hz: f64, timing: TimingConfig) -> Self {
        info!(
            "Measurements at {:.0} Hz, {:.0} Hz bandwidth, timing {:?}",
            frequency_hz, bandwidth_hz, timing
        );
        VesnaTestbed {
            alh,
            frequency_hz,
            bandwidth_hz,
            timing,
            generator_configs: HashMap::new(),
            sensor_configs: HashMap::new(),
            transmission: None,
            last_stats: None,
        }
    }

    fn check_cluster(&self, node: &NodeId) -> Result<()> {
        if node.cluster != self.alh.cluster() {
            return Err(TestbedError::Node {
                node: *node,
                reason: format!("node is not in cluster {}", self.alh.cluster()),
            });
        }
        Ok(())
    }

    fn fetch_config_list(&self, session: &AlhSession, node: &NodeId, resource: &str) -> Result<ConfigList> {
        let text = self.alh.node_get(&session.credentials, node, resource)?;
        ConfigList::parse(&text).map_err(|reason| {
            error!("Unreadable {} from {}: {}", resource, node, reason);
            TestbedError::Node {
                node: *node,
                reason: format!("unreadable {resource}: {reason}"),
            }
        })
    }

    fn generator_configs(&mut self, session: &AlhSession, node: &NodeId) -> Result<&ConfigList> {
        if !self.generator_configs.contains_key(node) {
            let list = self.fetch_config_list(session, node, "generator/deviceConfigList")?;
            info!("Signal generator on {} has {} configurations", node, list.configs.len());
            self.generator_configs.insert(*node, list);
        }
        Ok(&self.generator_configs[node])
    }

    fn sensor_configs(&mut self, session: &AlhSession, node: &NodeId) -> Result<&ConfigList> {
        if !self.sensor_configs.contains_key(node) {
            let list = self.fetch_config_list(session, node, "sensing/deviceConfigList")?;
            info!("Spectrum sensor on {} has {} configurations", node, list.configs.len());
            self.sensor_configs.insert(*node, list);
        }
        Ok(&self.sensor_configs[node])
    }

    fn wait_for_slot(&self, session: &AlhSession, node: &NodeId, slot: u32) -> Result<()> {
        let started = Instant::now();
        let resource = format!("sensing/slotInformation?id={slot}");
        loop {
            let status = self.alh.node_get(&session.credentials, node, &resource)?;
            if slot_complete(&status) {
                return Ok(());
            }
            if started.elapsed() >= self.timing.max_wait() {
                error!("Sensing on {} still incomplete after {} s: {}", node, self.timing.max_wait_s, status);
                return Err(TestbedError::Communication(format!(
                    "sensing on {node} did not complete within {} s",
                    self.timing.max_wait_s
                )));
            }
            info!("waiting...");
            thread::sleep(self.timing.poll_interval());
        }
    }
}

impl TestbedClient for VesnaTestbed {
    type Session = AlhSession;

    fn authenticate(&mut self, credentials: &Credentials) -> Result<AlhSession> {
        let hello = self.alh.hello(credentials)?;
        info!("Coordinator of cluster {} answered: {}", self.alh.cluster(), hello);
        Ok(AlhSession {
            credentials: credentials.clone(),
        })
    }

    fn set_transmit_state(
        &mut self,
        session: &AlhSession,
        node: &NodeId,
        on: bool,
        power_dbm: f64,
    ) -> Result<()> {
        self.check_cluster(node)?;

        if !on {
            info!("Stopping signal generator on {}", node);
            self.transmission = None;
            self.alh.node_post(&session.credentials, node, "generator/stop", "")?;
            return Ok(());
        }

        // the generator only takes whole dBm; anything else would not be
        // the power the gain is computed with
        if power_dbm.fract() != 0.0 {
            return Err(TestbedError::Node {
                node: *node,
                reason: format!("signal generator takes whole dBm, got {power_dbm} dBm"),
            });
        }

        let f_hz = self.frequency_hz;
        let selection = self
            .generator_configs(session, node)?
            .tx_config(f_hz, power_dbm)
            .ok_or_else(|| TestbedError::Node {
                node: *node,
                reason: format!("node can not transmit {power_dbm} dBm at {f_hz:.0} Hz"),
            })?;

        let program = GeneratorProgram {
            selection,
            power_dbm: power_dbm as i32,
            delay_s: self.timing.tx_delay_s,
            duration_s: self.timing.tx_duration_s,
        };
        info!("Programming signal generator on {}: {}", node, program);
        let programmed_at = Instant::now();
        self.alh
            .node_post(&session.credentials, node, "generator/program", &program.to_string())?;
        self.transmission = Some(Transmission {
            node: *node,
            programmed_at,
        });
        Ok(())
    }

    fn sample_power(&mut self, session: &AlhSession, node: &NodeId) -> Result<f64> {
        self.check_cluster(node)?;
        self.last_stats = None;

        let (f_hz, bw_hz) = (self.frequency_hz, self.bandwidth_hz);
        let selection = self
            .sensor_configs(session, node)?
            .sweep_config(f_hz, bw_hz)
            .ok_or_else(|| TestbedError::Node {
                node: *node,
                reason: format!("node can not sense {f_hz:.0} Hz with {bw_hz:.0} Hz bandwidth"),
            })?;

        let since_tx = self.transmission.map(|tx| tx.programmed_at.elapsed());
        let delay_s = sensing_delay(&self.timing, since_tx).map_err(|reason| {
            error!("Can not schedule sensing on {}: {}", node, reason);
            TestbedError::InvalidMeasurement(reason)
        })?;
        if let (Some(tx), Some(since)) = (self.transmission, since_tx) {
            info!(
                "Generator on {} was programmed {:.2} s ago, sensing in {} s",
                tx.node,
                since.as_secs_f64(),
                delay_s
            );
        }

        let program = SensorProgram {
            selection,
            delay_s,
            duration_s: self.timing.sense_duration_s,
            slot: SENSING_SLOT,
        };
        info!("Programming spectrum sensor on {}: {}", node, program);
        self.alh
            .node_post(&session.credentials, node, "sensing/program", &program.to_string())?;

        self.wait_for_slot(session, node, SENSING_SLOT)?;

        let data = self.alh.node_get(
            &session.credentials,
            node,
            &format!("sensing/slotDataText?id={SENSING_SLOT}"),
        )?;
        let samples = parse_slot_data(&data).map_err(|reason| TestbedError::Node {
            node: *node,
            reason,
        })?;
        let stats = SweepStats::from_dbm(&samples).ok_or_else(|| TestbedError::Node {
            node: *node,
            reason: "sensing slot holds no samples".to_string(),
        })?;

        info!(
            "Power at {} = {:.1} dBm (mean={:e} mW std={:e} mW, {} samples)",
            node,
            stats.mean_dbm(),
            stats.mean_mw,
            stats.std_mw,
            stats.samples
        );
        self.last_stats = Some(stats);
        Ok(stats.mean_dbm())
    }

    fn last_sweep_stats(&self) -> Option<SweepStats> {
        self.last_stats
    }
}
