//! ECN marking and congestion feedback
//!
//! Two halves:
//!
//! - [`ClassMarker`] lives on a switch egress class and decides, packet by
//!   packet, which ECN codepoint a departing packet leaves with.
//! - [`EcnAccount`] lives on a receiving NIC, counts marked packets per remote
//!   flow and turns them into periodic congestion feedback.
//!
//! ## Marking variants
//!
//! - **Standard**: CE whenever the egress queue is congested.
//! - **NoPause**: CE only once the packets that were held back by the last
//!   pause have left, so a queue that merely drains a pause is not blamed.
//! - **RootCause**: right after a resume every packet leaves as ECT(0), a
//!   "suspect" mark that cuts no rate. Once the resume window is over the
//!   class only escalates to CE if the queue keeps growing.

use std::time::Duration;

use qbb_core::{Ecn, SimTime};

use crate::config::{EcnVariant, QbbConfig};

/// Root-cause marking thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootEcnParams {
    /// Window after a resume in which packets are marked suspect
    pub interval: Duration,
    /// Queue growth between checks that counts as still congested
    pub growth_bytes: u64,
    /// Queue depth at which the class is considered drained
    pub drain_bytes: u64,
}

impl RootEcnParams {
    pub fn from_config(config: &QbbConfig) -> Self {
        Self {
            interval: config.root_ecn_interval(),
            growth_bytes: config.root_ecn_growth_bytes,
            drain_bytes: config.root_ecn_drain_bytes,
        }
    }
}

/// Root-cause tracking state of one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootState {
    /// Nothing suspicious
    #[default]
    Idle,
    /// Past the resume window with a shrinking queue, watching growth
    Watching,
    /// Inside the resume window
    Resumed,
    /// Identified as a congestion root
    Congested,
}

/// Marking state of one switch egress class
#[derive(Debug, Clone, Default)]
pub struct ClassMarker {
    paused_packets: usize,
    last_resume: Option<SimTime>,
    queue_upon_resume: u64,
    last_timeout: SimTime,
    last_timeout_queue: u64,
    state: RootState,
}

impl ClassMarker {
    /// Snapshot the class as it resumes
    pub fn on_resume(&mut self, now: SimTime, queued_packets: usize, shared_bytes: u64) {
        self.last_resume = Some(now);
        self.paused_packets = queued_packets;
        self.queue_upon_resume = shared_bytes;
    }

    /// A packet of this class made it onto the wire
    pub fn on_transmitted(&mut self) {
        self.paused_packets = self.paused_packets.saturating_sub(1);
    }

    pub fn paused_packets(&self) -> usize {
        self.paused_packets
    }

    pub fn state(&self) -> RootState {
        self.state
    }

    /// Codepoint a departing packet should carry, or `None` to leave it as is
    ///
    /// `congested` is the RED decision for the egress queue, `shared_bytes` its
    /// depth after the packet left and `current` the packet's codepoint.
    pub fn decide(
        &mut self,
        variant: EcnVariant,
        root: &RootEcnParams,
        congested: bool,
        shared_bytes: u64,
        current: Ecn,
        now: SimTime,
    ) -> Option<Ecn> {
        match variant {
            EcnVariant::Standard => congested.then_some(Ecn::Ce),
            EcnVariant::NoPause => (congested && self.paused_packets == 0).then_some(Ecn::Ce),
            EcnVariant::RootCause => self.decide_root(root, congested, shared_bytes, current, now),
        }
    }

    fn decide_root(
        &mut self,
        root: &RootEcnParams,
        congested: bool,
        shared_bytes: u64,
        current: Ecn,
        now: SimTime,
    ) -> Option<Ecn> {
        let since_resume = self
            .last_resume
            .map_or(Duration::MAX, |at| now.saturating_since(at));
        if since_resume <= root.interval {
            self.state = RootState::Resumed;
            return (current != Ecn::Ce).then_some(Ecn::Ect0);
        }

        let mark = congested.then_some(Ecn::Ce);
        match self.state {
            RootState::Resumed if shared_bytes >= self.queue_upon_resume => {
                self.state = RootState::Congested;
                mark
            }
            RootState::Resumed => {
                self.last_timeout = now;
                self.last_timeout_queue = shared_bytes;
                self.state = RootState::Watching;
                None
            }
            RootState::Watching if now.saturating_since(self.last_timeout) >= root.interval => {
                if shared_bytes >= self.last_timeout_queue + root.growth_bytes {
                    self.state = RootState::Congested;
                    return mark;
                }
                self.last_timeout = now;
                self.last_timeout_queue = shared_bytes;
                if shared_bytes <= root.drain_bytes {
                    self.state = RootState::Idle;
                }
                None
            }
            RootState::Watching => {
                if shared_bytes <= root.drain_bytes {
                    self.state = RootState::Idle;
                }
                None
            }
            RootState::Idle | RootState::Congested => {
                self.state = if congested {
                    RootState::Congested
                } else {
                    RootState::Idle
                };
                mark
            }
        }
    }
}

/// Feedback a receiver reports for one remote flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnFeedback {
    pub ecn_bits: u8,
    /// Marked packets
    pub qfb: u16,
    /// Packets seen
    pub total: u16,
}

/// Receiver-side marking counters of one remote flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnAccount {
    ecn_bits: u8,
    qfb: u32,
    total: u32,
}

impl EcnAccount {
    /// Count one arriving packet carrying `ecn`; marks only count when `sampling`
    pub fn record(&mut self, ecn: Ecn, sampling: bool) {
        if ecn != Ecn::NotEct && sampling {
            self.ecn_bits |= ecn.bits();
            self.qfb += 1;
        }
        self.total += 1;
    }

    pub fn marked(&self) -> u32 {
        self.qfb
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Close the current interval: feedback to send, if any, and reset
    ///
    /// With `no_pause` set the bits are recomputed from the marked fraction:
    /// only a flow with nearly every packet marked reports congestion.
    pub fn take_feedback(&mut self, no_pause: bool) -> Option<EcnFeedback> {
        let mut bits = self.ecn_bits;
        if no_pause {
            bits = if self.total > 0 && f64::from(self.qfb) >= 0.95 * f64::from(self.total) {
                Ecn::Ce.bits()
            } else {
                0
            };
        }
        let feedback = EcnFeedback {
            ecn_bits: bits,
            qfb: u16::try_from(self.qfb).unwrap_or(u16::MAX),
            total: u16::try_from(self.total).unwrap_or(u16::MAX),
        };
        *self = Self::default();
        (bits > 0).then_some(feedback)
    }
}
