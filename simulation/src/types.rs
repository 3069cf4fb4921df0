//! Core data structures of the simulation harness

use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use qbb_core::{DataRate, DeviceTimer, NodeId, Packet, PortIndex};

/// Index of a sending application
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("app{_0}")]
pub struct AppId(pub usize);

/// Far end of one port's point-to-point channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLink {
    pub peer: NodeId,
    pub peer_port: PortIndex,
    pub rate: DataRate,
    pub delay: Duration,
}

/// Everything the scheduler can fire
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// A packet finished crossing a channel and reaches (`node`, `port`)
    Arrive {
        node: NodeId,
        port: PortIndex,
        packet: Packet,
    },
    /// A timer scheduled by the device at (`node`, `port`)
    Timer {
        node: NodeId,
        port: PortIndex,
        timer: DeviceTimer,
    },
    /// A sending application emits its next packet
    AppSend { app: AppId },
}

impl SimEvent {
    /// Short name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            SimEvent::Arrive { .. } => "arrive",
            SimEvent::Timer { .. } => "timer",
            SimEvent::AppSend { .. } => "app_send",
        }
    }
}

/// Work produced by a device call that the node must carry out
#[derive(Debug)]
pub(crate) enum NodeAction {
    /// A device handed a packet up to its node
    Deliver {
        node: NodeId,
        port: PortIndex,
        packet: Packet,
    },
    /// Send a packet out of (`node`, `port`)
    Send {
        node: NodeId,
        port: PortIndex,
        packet: Packet,
    },
}
