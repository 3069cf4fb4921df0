//! Error types for the simulation harness

use thiserror::Error;

use qbb_core::{ConfigError, NodeId, PortIndex, TopologyError};
use qbb_device::DeviceError;

/// Errors raised while building or running a simulation
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Node {0} is not a host")]
    NotAHost(NodeId),

    #[error("No device at {node}/{port}")]
    NoDevice { node: NodeId, port: PortIndex },

    #[error("Flow from {from} to {to} must have at least one packet")]
    EmptyFlow { from: NodeId, to: NodeId },
}

/// Result type alias for simulation operations
pub type SimResult<T> = Result<T, SimulationError>;
