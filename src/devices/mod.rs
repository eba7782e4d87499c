pub mod alh;
#[cfg(test)]
pub(crate) mod mock_alh;
pub mod vesna;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::Credentials;
use crate::power::SweepStats;

pub use alh::AlhWeb;
pub use vesna::VesnaTestbed;

/// A sensor node on the testbed, addressed through its cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NodeId {
    pub cluster: u16,
    pub address: u16,
}

impl NodeId {
    pub fn new(cluster: u16, address: u16) -> Self {
        Self { cluster, address }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.address)
    }
}

#[derive(Error, Debug)]
pub enum TestbedError {
    #[error("communication error: {0}")]
    Communication(String),

    #[error("authorization error: {0}")]
    Authorization(String),

    #[error("node {node} error: {reason}")]
    Node { node: NodeId, reason: String },

    /// The client could not take the measurement under the conditions it
    /// was asked for, e.g. sensing would outlast the transmission.
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
}

pub type Result<T> = std::result::Result<T, TestbedError>;

/// Remote control of testbed nodes.
///
/// Every call blocks until the testbed has answered. Implementations enforce
/// their own timeouts and report them as [`TestbedError::Communication`].
pub trait TestbedClient {
    type Session;

    fn authenticate(&mut self, credentials: &Credentials) -> Result<Self::Session>;

    /// Start (`on = true`) or stop transmitting a constant carrier at `power_dbm`.
    fn set_transmit_state(
        &mut self,
        session: &Self::Session,
        node: &NodeId,
        on: bool,
        power_dbm: f64,
    ) -> Result<()>;

    /// Received power at `node` in dBm.
    fn sample_power(&mut self, session: &Self::Session, node: &NodeId) -> Result<f64>;

    /// Spread of the sweep behind the last `sample_power`, when the client has one.
    fn last_sweep_stats(&self) -> Option<SweepStats> {
        None
    }
}
