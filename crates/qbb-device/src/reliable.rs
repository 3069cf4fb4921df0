//! Reliable chunked delivery
//!
//! The sender keeps every transmitted data packet of a flow in a
//! [`SendBuffer`] until an ACK or NACK moves the acknowledged point past it.
//! The receiver tracks the next expected sequence number per remote flow in a
//! [`ReceiverState`] and turns every arriving sequence number into a
//! [`SeqOutcome`].
//!
//! ACK and NACK frames both carry the receiver's next expected sequence
//! number. The sender keeps everything from that number on.

use std::collections::VecDeque;
use std::time::Duration;

use qbb_core::{Packet, SimTime};

use crate::config::QbbConfig;

/// Start of the chunk containing `seq`; `seq` itself when chunking is off
pub fn chunk_floor(seq: u32, chunk: u32) -> u32 {
    if chunk == 0 {
        seq
    } else {
        seq / chunk * chunk
    }
}

/// Unacknowledged data packets of one flow, oldest first
#[derive(Debug, Clone)]
pub struct SendBuffer {
    entries: VecDeque<(u32, Packet)>,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Retain `packet` sent with `seq`; returns the oldest entry if it had to go
    pub fn push(&mut self, seq: u32, packet: Packet) -> Option<(u32, Packet)> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back((seq, packet));
        evicted
    }

    /// Drop entries with a sequence number below `target`; returns how many
    pub fn trim_below(&mut self, target: u32) -> usize {
        let mut trimmed = 0;
        while self.entries.front().is_some_and(|(seq, _)| *seq < target) {
            self.entries.pop_front();
            trimmed += 1;
        }
        trimmed
    }

    pub fn head_seq(&self) -> Option<u32> {
        self.entries.front().map(|(seq, _)| *seq)
    }

    /// Retained packets, oldest first
    pub fn packets(&self) -> impl Iterator<Item = &Packet> + '_ {
        self.entries.iter().map(|(_, p)| p)
    }

    pub fn contains_uid(&self, uid: u64) -> bool {
        self.entries.iter().any(|(_, p)| p.uid() == uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What a receiver does with an arriving sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    /// In order; acknowledge up to the carried next-expected number
    Ack(u32),
    /// Gap detected; ask the sender to go back to the carried number
    Nack(u32),
    /// In order, nothing to send
    Accepted,
    /// Gap already reported within the NACK interval
    NackSuppressed,
    /// Older than what is expected
    Duplicate,
}

/// Receiver-side acknowledgement settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub ack_interval: u32,
    pub chunk_size: u32,
    pub back_to_zero: bool,
    pub test_read: bool,
    pub nack_interval: Duration,
}

impl AckPolicy {
    pub fn from_config(config: &QbbConfig) -> Self {
        Self {
            ack_interval: config.ack_interval,
            chunk_size: config.chunk_size,
            back_to_zero: config.back_to_zero,
            test_read: config.test_read,
            nack_interval: config.nack_interval(),
        }
    }
}

/// Sequence tracking for one remote flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverState {
    expected: u32,
    milestone: u32,
    last_nack: Option<u32>,
    nack_deadline: SimTime,
}

impl ReceiverState {
    pub fn new(policy: &AckPolicy) -> Self {
        Self {
            expected: 0,
            milestone: policy.ack_interval,
            last_nack: None,
            nack_deadline: SimTime::ZERO,
        }
    }

    /// Next sequence number expected from the sender
    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn milestone(&self) -> u32 {
        self.milestone
    }

    pub fn check_seq(&mut self, seq: u32, now: SimTime, policy: &AckPolicy) -> SeqOutcome {
        if seq == self.expected {
            self.expected += 1;
            if policy.ack_interval == 0 {
                return SeqOutcome::Accepted;
            }
            if self.expected >= self.milestone {
                self.milestone += policy.ack_interval;
                return SeqOutcome::Ack(self.expected);
            }
            if policy.chunk_size > 0 && self.expected % policy.chunk_size == 0 {
                return SeqOutcome::Ack(self.expected);
            }
            return SeqOutcome::Accepted;
        }
        if seq < self.expected {
            return SeqOutcome::Duplicate;
        }
        if now <= self.nack_deadline && self.last_nack == Some(self.expected) {
            return SeqOutcome::NackSuppressed;
        }
        self.nack_deadline = now + policy.nack_interval;
        self.last_nack = Some(self.expected);
        if policy.back_to_zero && !policy.test_read {
            self.expected = chunk_floor(self.expected, policy.chunk_size);
        }
        SeqOutcome::Nack(self.expected)
    }
}
