//! Trace events emitted by devices
//!
//! Devices never poll or aggregate their own statistics. Every observable
//! step (a packet starting or finishing serialization, a drop, a pause, a
//! rate sample) is pushed through [`crate::DeviceContext::trace`] as a
//! [`TraceEvent`], and whoever owns the context decides what to keep.

use serde::{Deserialize, Serialize};

use crate::identity::{FlowKey, PortIndex};
use crate::time::DataRate;

/// Why a packet was dropped before reaching the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// The device's link is administratively down
    LinkDown,
    /// The shared buffer refused the packet
    Admission,
    /// The channel refused the packet
    ChannelBusy,
    /// The error model corrupted the packet
    Corrupted,
}

/// An observable step inside a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceEvent {
    /// A packet started serialization onto the channel
    PhyTxBegin { uid: u64, size: u32 },

    /// A packet finished serialization
    PhyTxEnd { uid: u64, size: u32 },

    /// The channel refused a packet
    PhyTxDrop { uid: u64, size: u32 },

    /// A packet was fully received
    PhyRxEnd { uid: u64, size: u32 },

    /// A received packet was discarded by the error model
    PhyRxDrop { uid: u64, size: u32 },

    /// A packet was accepted for transmission
    MacTx { uid: u64, size: u32 },

    /// A packet was refused before queueing
    MacTxDrop {
        uid: u64,
        size: u32,
        reason: DropReason,
    },

    /// A packet was handed to the upper layer
    MacRx { uid: u64, size: u32 },

    /// A PFC frame paused (or, with zero duration, resumed) a local class
    PauseReceived { priority: u8, duration_us: u32 },

    /// A PFC frame was sent upstream on `port`
    PauseSent {
        port: PortIndex,
        priority: u8,
        resume: bool,
    },

    /// A congestion notification reached a flow's rate controller
    CongestionNotified { flow: FlowKey, fraction: f64 },

    /// A flow's send buffer was replayed into the egress queue
    Retransmit { flow: FlowKey, packets: usize },

    /// Periodic sample of a flow's effective rate
    RateSample { flow: FlowKey, rate: DataRate },

    /// Periodic sample of one egress class
    QueueSample { priority: u8, bytes: u64 },
}

impl TraceEvent {
    /// Packet uid, for per-packet events
    pub fn packet_uid(&self) -> Option<u64> {
        match self {
            TraceEvent::PhyTxBegin { uid, .. }
            | TraceEvent::PhyTxEnd { uid, .. }
            | TraceEvent::PhyTxDrop { uid, .. }
            | TraceEvent::PhyRxEnd { uid, .. }
            | TraceEvent::PhyRxDrop { uid, .. }
            | TraceEvent::MacTx { uid, .. }
            | TraceEvent::MacTxDrop { uid, .. }
            | TraceEvent::MacRx { uid, .. } => Some(*uid),
            _ => None,
        }
    }

    /// Short name used as a log field and as a counter key
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::PhyTxBegin { .. } => "phy_tx_begin",
            TraceEvent::PhyTxEnd { .. } => "phy_tx_end",
            TraceEvent::PhyTxDrop { .. } => "phy_tx_drop",
            TraceEvent::PhyRxEnd { .. } => "phy_rx_end",
            TraceEvent::PhyRxDrop { .. } => "phy_rx_drop",
            TraceEvent::MacTx { .. } => "mac_tx",
            TraceEvent::MacTxDrop { .. } => "mac_tx_drop",
            TraceEvent::MacRx { .. } => "mac_rx",
            TraceEvent::PauseReceived { .. } => "pause_received",
            TraceEvent::PauseSent { .. } => "pause_sent",
            TraceEvent::CongestionNotified { .. } => "congestion_notified",
            TraceEvent::Retransmit { .. } => "retransmit",
            TraceEvent::RateSample { .. } => "rate_sample",
            TraceEvent::QueueSample { .. } => "queue_sample",
        }
    }
}
