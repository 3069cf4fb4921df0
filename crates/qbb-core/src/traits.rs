//! Core traits for the QBB fabric
//!
//! These traits are the seams between a device and everything around it.
//!
//! ## Key Traits
//!
//! - [`DeviceContext`]: Clock, timers, channel and upper layer, as seen by one device
//! - [`AdmissionControl`]: Shared-buffer accounting owned by a switch node
//! - [`ErrorModel`]: Receive-side corruption

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::TraceEvent;
use crate::identity::{FlowIndex, FlowKey, PortIndex, PriorityMask};
use crate::packet::Packet;
use crate::time::SimTime;

/// Handle of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

/// Every timer a device can schedule
///
/// When a timer fires, the context hands the value back to the device that
/// scheduled it, which dispatches on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceTimer {
    /// The in-flight packet finished serialization
    TransmitComplete,
    /// Earliest rate-limited flow becomes eligible again
    NextSend,
    /// A PFC pause on a local egress class ran out
    PauseExpired { priority: u8 },
    /// Re-evaluate an outstanding upstream pause for (ingress port, priority)
    RecheckPause { port: PortIndex, priority: u8 },
    /// Time-based rate increase for one hop of a flow
    RateIncrease { flow: FlowIndex, hop: u8 },
    /// Alpha decay for one hop of a flow
    AlphaResume { flow: FlowIndex, hop: u8 },
    /// No ACK arrived for a flow waiting on a milestone
    Retransmit { flow: FlowIndex },
    /// Emit accumulated congestion feedback for a remote flow
    CnpCheck { key: FlowKey },
    /// Periodic rate and queue sampling
    Sample,
}

/// Everything a device needs from its surroundings
///
/// A device holds no reference to its node, channel or scheduler. Every entry
/// point receives a context, and every side effect goes through it. The
/// simulation implements this per event; [`crate::MockContext`] implements it
/// for unit tests.
pub trait DeviceContext {
    /// Current virtual time
    fn now(&self) -> SimTime;

    /// Schedule `timer` to fire after `delay`
    fn schedule(&mut self, delay: Duration, timer: DeviceTimer) -> TimerId;

    /// Cancel a scheduled timer; cancelling a fired or unknown timer is a no-op
    fn cancel(&mut self, id: TimerId);

    /// Whether `id` is still scheduled and not cancelled
    fn is_pending(&self, id: TimerId) -> bool;

    /// Start putting `packet` on the channel; the far end receives it after
    /// `tx_time` plus propagation delay. Returns false if the channel refused.
    fn transmit_start(&mut self, packet: Packet, tx_time: Duration) -> bool;

    /// Hand a received packet to the node (application or forwarding)
    fn deliver_up(&mut self, packet: Packet);

    /// Ask the node to send `packet` out of another of its ports
    fn send_on_port(&mut self, port: PortIndex, packet: Packet);

    /// The node's shared-buffer controller, if the node is a switch
    fn admission(&mut self) -> Option<&mut dyn AdmissionControl>;

    /// Record an observability event
    fn trace(&mut self, event: TraceEvent);
}

/// Shared-buffer admission, pause and ECN decisions of a switch
///
/// Checks never mutate. A caller checks every gate a packet must pass and
/// only then commits all of the matching updates, so a packet is either
/// fully accounted or not at all.
pub trait AdmissionControl {
    fn check_ingress(&self, port: PortIndex, priority: usize, size: u32) -> bool;

    fn check_egress(&self, port: PortIndex, priority: usize, size: u32) -> bool;

    fn update_ingress(&mut self, port: PortIndex, priority: usize, size: u32);

    fn update_egress(&mut self, port: PortIndex, priority: usize, size: u32);

    fn remove_from_ingress(&mut self, port: PortIndex, priority: usize, size: u32);

    fn remove_from_egress(&mut self, port: PortIndex, priority: usize, size: u32);

    /// Classes of ingress `port` that must be paused upstream
    fn pause_classes(&self, port: PortIndex, priority: usize) -> PriorityMask;

    /// Whether an upstream pause on (`port`, `priority`) can be lifted
    fn should_resume(&self, port: PortIndex, priority: usize) -> bool;

    /// Whether a packet leaving `egress` should carry a congestion mark
    fn should_send_cn(&mut self, ingress: PortIndex, egress: PortIndex, priority: usize) -> bool;

    fn set_remote_paused(&mut self, port: PortIndex, priority: usize, paused: bool);

    fn is_remote_paused(&self, port: PortIndex, priority: usize) -> bool;

    /// Bytes of (egress `port`, `priority`) held in the shared pool
    fn egress_shared_bytes(&self, port: PortIndex, priority: usize) -> u64;
}

/// Receive-side corruption model
pub trait ErrorModel {
    /// Whether `packet` arrives corrupted and must be discarded
    fn is_corrupt(&mut self, packet: &Packet) -> bool;
}
