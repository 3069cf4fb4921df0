//! Sender-side flow table
//!
//! A NIC creates one [`FlowRecord`] the first time it sends to a (destination,
//! source port, priority) triple. Records are never removed, so a
//! [`FlowIndex`] stays valid for the lifetime of the device and can be carried
//! in timers.

use std::collections::HashMap;

use qbb_core::{FlowIndex, FlowKey, SimTime};

use crate::queue::RateGate;
use crate::rate::FlowRate;
use crate::reliable::SendBuffer;
use crate::timers::TimerSlot;

/// Everything a NIC tracks about one outgoing flow
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub index: FlowIndex,
    /// Egress class the flow's packets are queued in
    pub class: usize,
    pub rate: FlowRate,
    /// Pacing credit in bytes earned while other flows were sending
    pub credits: f64,
    /// Earliest time the flow may send again
    pub next_avail: SimTime,
    /// Blocked until the current chunk is acknowledged
    pub waiting_ack: bool,
    /// Next-expected value an ACK must reach to release the flow
    pub milestone_tx: u32,
    pub send_buffer: SendBuffer,
    pub retransmit_timer: TimerSlot,
}

impl FlowRecord {
    /// Gate the egress queue consults before serving this flow's class
    pub fn gate(&self) -> RateGate {
        RateGate {
            priority: usize::from(self.key.priority),
            next_avail: self.next_avail,
        }
    }
}

/// Arena of flow records indexed by [`FlowIndex`] and by [`FlowKey`]
#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    flows: Vec<FlowRecord>,
    by_key: HashMap<FlowKey, FlowIndex>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<FlowIndex> {
        self.by_key.get(key).copied()
    }

    pub fn get(&self, index: FlowIndex) -> Option<&FlowRecord> {
        self.flows.get(index.as_usize())
    }

    pub fn get_mut(&mut self, index: FlowIndex) -> Option<&mut FlowRecord> {
        self.flows.get_mut(index.as_usize())
    }

    /// Index of the flow for `key`, creating it with `make` on first use
    pub fn insert_with(
        &mut self,
        key: FlowKey,
        make: impl FnOnce(FlowIndex) -> FlowRecord,
    ) -> FlowIndex {
        if let Some(index) = self.lookup(&key) {
            return index;
        }
        let index = FlowIndex(u32::try_from(self.flows.len()).unwrap_or(u32::MAX));
        self.flows.push(make(index));
        self.by_key.insert(key, index);
        index
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowRecord> + '_ {
        self.flows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowRecord> + '_ {
        self.flows.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Pacing gates of every flow, in index order
    pub fn gates(&self) -> Vec<RateGate> {
        self.flows.iter().map(FlowRecord::gate).collect()
    }
}
