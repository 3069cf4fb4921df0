//! Receive-side error models

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::Packet;
use crate::traits::ErrorModel;

/// Corrupts each packet independently with a fixed probability
#[derive(Debug, Clone)]
pub struct RateErrorModel {
    rate: f64,
    rng: StdRng,
}

impl RateErrorModel {
    /// `rate` is clamped to `[0, 1]`
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ErrorModel for RateErrorModel {
    fn is_corrupt(&mut self, _packet: &Packet) -> bool {
        self.rate > 0.0 && self.rng.random::<f64>() < self.rate
    }
}

/// Corrupts the packets whose uids are listed, each exactly once
///
/// A retransmitted copy keeps its uid, so each listed uid is forgotten after
/// its first hit or the flow would never recover.
#[derive(Debug, Clone, Default)]
pub struct ListErrorModel {
    uids: HashSet<u64>,
}

impl ListErrorModel {
    pub fn new(uids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            uids: uids.into_iter().collect(),
        }
    }

    pub fn add(&mut self, uid: u64) {
        self.uids.insert(uid);
    }
}

impl ErrorModel for ListErrorModel {
    fn is_corrupt(&mut self, packet: &Packet) -> bool {
        self.uids.remove(&packet.uid())
    }
}

/// Corrupts data packets of a flow whose sequence number is listed, once each
#[derive(Debug, Clone, Default)]
pub struct SequenceErrorModel {
    seqs: HashSet<u32>,
}

impl SequenceErrorModel {
    pub fn new(seqs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            seqs: seqs.into_iter().collect(),
        }
    }
}

impl ErrorModel for SequenceErrorModel {
    fn is_corrupt(&mut self, packet: &Packet) -> bool {
        match crate::frame::Frame::decode(packet) {
            Ok(crate::frame::Frame::Data { seq_ts, .. }) => self.seqs.remove(&seq_ts.seq),
            _ => false,
        }
    }
}
