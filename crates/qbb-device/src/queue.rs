//! Multi-class egress queue
//!
//! One FIFO per class, with three selection policies:
//!
//! - [`EgressQueue::dequeue_strict`]: NIC without QCN. Highest class first.
//! - [`EgressQueue::dequeue_rate_limited`]: NIC with QCN. Class 0 carries
//!   control frames and is always served first; every other class belongs to
//!   one flow and is served round-robin once the flow's next-available time
//!   has passed.
//! - [`EgressQueue::dequeue_round_robin`]: switch. The control class is
//!   served first, then the start position rotates among eligible classes.
//!
//! The pause mask gates selection only. Enqueue never blocks and never drops.

use std::collections::VecDeque;

use qbb_core::{Packet, PriorityMask, SimTime, PRIORITY_COUNT};

/// Class carrying control frames on switches and non-QCN NICs
pub const CONTROL_CLASS: usize = PRIORITY_COUNT - 1;

/// Class carrying control frames on QCN NICs
pub const QCN_CONTROL_CLASS: usize = 0;

/// Eligibility of one flow class under rate limiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateGate {
    /// Priority whose pause state gates this class
    pub priority: usize,
    /// Earliest time the flow may send again
    pub next_avail: SimTime,
}

#[derive(Debug, Default, Clone)]
struct ClassQueue {
    packets: VecDeque<Packet>,
    bytes: u64,
}

impl ClassQueue {
    fn push(&mut self, packet: Packet) {
        self.bytes += u64::from(packet.size());
        self.packets.push_back(packet);
    }

    fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.bytes -= u64::from(packet.size());
        Some(packet)
    }
}

/// Per-class FIFOs of one device
#[derive(Debug, Clone)]
pub struct EgressQueue {
    classes: Vec<ClassQueue>,
    rr_last: usize,
    last_class: Option<usize>,
}

impl Default for EgressQueue {
    fn default() -> Self {
        Self::new(PRIORITY_COUNT)
    }
}

impl EgressQueue {
    pub fn new(classes: usize) -> Self {
        Self {
            classes: vec![ClassQueue::default(); classes.max(1)],
            rr_last: 0,
            last_class: None,
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Grow to at least `count` classes
    pub fn ensure_classes(&mut self, count: usize) {
        if self.classes.len() < count {
            self.classes.resize_with(count, ClassQueue::default);
        }
    }

    /// Append `packet` to `class`, growing the class table if needed
    pub fn enqueue(&mut self, packet: Packet, class: usize) {
        self.ensure_classes(class + 1);
        self.classes[class].push(packet);
    }

    /// Class of the most recently dequeued packet
    pub fn last_class(&self) -> Option<usize> {
        self.last_class
    }

    pub fn bytes_in(&self, class: usize) -> u64 {
        self.classes.get(class).map_or(0, |c| c.bytes)
    }

    pub fn packets_in(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, |c| c.packets.len())
    }

    pub fn total_bytes(&self) -> u64 {
        self.classes.iter().map(|c| c.bytes).sum()
    }

    pub fn total_packets(&self) -> usize {
        self.classes.iter().map(|c| c.packets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|c| c.packets.is_empty())
    }

    pub fn head(&self, class: usize) -> Option<&Packet> {
        self.classes.get(class)?.packets.front()
    }

    fn take(&mut self, class: usize) -> Option<Packet> {
        let packet = self.classes.get_mut(class)?.pop()?;
        self.last_class = Some(class);
        Some(packet)
    }

    fn has_packets(&self, class: usize) -> bool {
        self.packets_in(class) > 0
    }

    /// Highest non-paused, non-empty class first
    ///
    /// A pause on the control class holds it like any other class.
    pub fn dequeue_strict(&mut self, paused: PriorityMask) -> Option<Packet> {
        let class = (0..self.classes.len())
            .rev()
            .find(|&c| self.has_packets(c) && !paused.contains(c))?;
        self.take(class)
    }

    /// Control class first, then rotate among non-paused, non-empty classes
    pub fn dequeue_round_robin(&mut self, paused: PriorityMask) -> Option<Packet> {
        if self.has_packets(CONTROL_CLASS) {
            return self.take(CONTROL_CLASS);
        }
        let count = self.classes.len();
        let class = (1..=count)
            .map(|offset| (self.rr_last + offset) % count)
            .find(|&c| c != CONTROL_CLASS && self.has_packets(c) && !paused.contains(c))?;
        self.rr_last = class;
        self.take(class)
    }

    /// QCN control class first, then round-robin over flows that may send
    ///
    /// `gates[i]` describes class `i + 1`. A flow class is eligible when it
    /// holds packets, its priority is not paused and its next-available time
    /// is not in the future.
    pub fn dequeue_rate_limited(
        &mut self,
        paused: PriorityMask,
        gates: &[RateGate],
        now: SimTime,
    ) -> Option<Packet> {
        if self.has_packets(QCN_CONTROL_CLASS) {
            return self.take(QCN_CONTROL_CLASS);
        }
        let flows = gates.len();
        if flows == 0 {
            return None;
        }
        let slot = (1..=flows)
            .map(|offset| (self.rr_last + offset) % flows)
            .find(|&i| {
                let gate = gates[i];
                self.has_packets(i + 1) && !paused.contains(gate.priority) && gate.next_avail <= now
            })?;
        self.rr_last = slot;
        self.take(slot + 1)
    }

    /// Replace the packets of `class` selected by `owned` with `replay`
    ///
    /// Packets of other flows sharing the class keep their order ahead of the
    /// replayed ones. Returns the number of packets replayed.
    pub fn recover(
        &mut self,
        class: usize,
        replay: impl IntoIterator<Item = Packet>,
        owned: impl Fn(&Packet) -> bool,
    ) -> usize {
        self.ensure_classes(class + 1);
        let queue = &mut self.classes[class];
        let kept: VecDeque<Packet> = queue.packets.drain(..).filter(|p| !owned(p)).collect();
        queue.bytes = kept.iter().map(|p| u64::from(p.size())).sum();
        queue.packets = kept;
        let mut replayed = 0;
        for packet in replay {
            queue.push(packet);
            replayed += 1;
        }
        replayed
    }

    /// Drop every queued packet
    pub fn clear(&mut self) {
        for class in &mut self.classes {
            class.packets.clear();
            class.bytes = 0;
        }
    }
}
