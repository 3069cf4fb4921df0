//! Reliable delivery between two NICs
//!
//! Tests for:
//! - ACK generation at milestones and chunk boundaries
//! - NACK on a sequence gap and go-back-N replay from the send buffer
//! - Back-to-zero rewinding to the start of a chunk
//! - Wait-for-ACK gating and the retransmit timeout
//! - Receive-side corruption

use qbb_core::{
    data_packet, Address, DeviceContext, DeviceTimer, FlowKey, Frame, MockContext, NodeId,
    NodeRole, Packet, PortIndex, QbbHeader, RateErrorModel, SeqTsHeader, SequenceErrorModel,
    SimTime, TraceEvent, UdpHeader,
};
use qbb_device::{QbbConfig, QbbNetDevice};

const SENDER: Address = Address::new(10, 0, 0, 1);
const RECEIVER: Address = Address::new(10, 0, 0, 2);
const SOURCE_PORT: u16 = 4000;
const PG: u16 = 3;

// ============================================================================
// Back-to-back harness
// ============================================================================

/// Two NICs joined by a zero-delay wire
///
/// Each device owns a [`MockContext`]. Packets a context records as
/// transmitted are handed to the far device immediately, and timers of both
/// contexts fire in global time order with the two clocks kept in step.
struct Pair {
    a: QbbNetDevice,
    ctx_a: MockContext,
    b: QbbNetDevice,
    ctx_b: MockContext,
    /// Every frame the receiver put on the wire
    from_b: Vec<Frame>,
}

impl Pair {
    fn new(config: QbbConfig) -> Self {
        let a = QbbNetDevice::new(NodeId(0), PortIndex(0), NodeRole::Nic, SENDER, config.clone())
            .unwrap();
        let b =
            QbbNetDevice::new(NodeId(1), PortIndex(0), NodeRole::Nic, RECEIVER, config).unwrap();
        Self {
            a,
            ctx_a: MockContext::new(),
            b,
            ctx_b: MockContext::new(),
            from_b: Vec::new(),
        }
    }

    fn send(&mut self, seq: u32) -> bool {
        let packet = data(seq, self.ctx_a.now());
        self.a.send(&mut self.ctx_a, packet)
    }

    fn send_all(&mut self, seqs: std::ops::Range<u32>) {
        for seq in seqs {
            assert!(self.send(seq));
        }
    }

    /// Move packets across until neither side has anything on the wire
    fn shuttle(&mut self) {
        loop {
            let to_b = self.ctx_a.take_transmitted();
            let to_a = self.ctx_b.take_transmitted();
            if to_b.is_empty() && to_a.is_empty() {
                return;
            }
            for packet in to_b {
                self.b.receive(&mut self.ctx_b, packet);
            }
            for packet in to_a {
                if let Ok(frame) = Frame::decode(&packet) {
                    self.from_b.push(frame);
                }
                self.a.receive(&mut self.ctx_a, packet);
            }
        }
    }

    /// Run both devices until no timer is due at or before `limit`
    fn run_until(&mut self, limit: SimTime) {
        loop {
            self.shuttle();
            let next_a = self.ctx_a.pending().first().map(|t| t.at);
            let next_b = self.ctx_b.pending().first().map(|t| t.at);
            let fire_a = match (next_a, next_b) {
                (Some(a), Some(b)) => a <= b,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => return,
            };
            if fire_a {
                let Some(timer) = self.ctx_a.pop_next_until(limit) else {
                    return;
                };
                self.ctx_b.set_now(self.ctx_a.now());
                self.a.on_timer(&mut self.ctx_a, timer);
            } else {
                let Some(timer) = self.ctx_b.pop_next_until(limit) else {
                    return;
                };
                self.ctx_a.set_now(self.ctx_b.now());
                self.b.on_timer(&mut self.ctx_b, timer);
            }
        }
    }

    fn acks(&self) -> Vec<u32> {
        self.from_b
            .iter()
            .filter_map(|f| match f {
                Frame::Ack(h) => Some(h.seq),
                _ => None,
            })
            .collect()
    }

    fn nacks(&self) -> Vec<u32> {
        self.from_b
            .iter()
            .filter_map(|f| match f {
                Frame::Nack(h) => Some(h.seq),
                _ => None,
            })
            .collect()
    }

    fn delivered(&self) -> Vec<u32> {
        self.ctx_b.delivered.iter().filter_map(seq_of).collect()
    }
}

// ============================================================================
// Helper functions for test setup
// ============================================================================

fn data(seq: u32, now: SimTime) -> Packet {
    data_packet(
        SENDER,
        RECEIVER,
        UdpHeader {
            source_port: SOURCE_PORT,
            destination_port: 5000,
        },
        SeqTsHeader { seq, ts: now, pg: PG },
        1000,
        now,
    )
}

fn seq_of(packet: &Packet) -> Option<u32> {
    match Frame::decode(packet) {
        Ok(Frame::Data { seq_ts, .. }) => Some(seq_ts.seq),
        _ => None,
    }
}

/// The sender's key for the flow under test
fn flow_key() -> FlowKey {
    FlowKey::new(RECEIVER, SOURCE_PORT, PG as u8)
}

/// The receiver's key for the same flow
fn remote_key() -> FlowKey {
    FlowKey::new(SENDER, SOURCE_PORT, PG as u8)
}

/// Feedback frame as the receiver would address it to the sender
fn feedback(frame: Frame, now: SimTime) -> Packet {
    frame.to_packet(RECEIVER, SENDER, now)
}

/// Fire only the sender's timers up to `limit`, collecting the data it sends
fn run_sender_alone(pair: &mut Pair, limit: SimTime) -> Vec<u32> {
    let mut sent: Vec<u32> = pair.ctx_a.take_transmitted().iter().filter_map(seq_of).collect();
    while let Some(timer) = pair.ctx_a.pop_next_until(limit) {
        pair.a.on_timer(&mut pair.ctx_a, timer);
        sent.extend(pair.ctx_a.take_transmitted().iter().filter_map(seq_of));
    }
    sent
}

fn retransmits(ctx: &MockContext) -> usize {
    ctx.traces_matching(|e| matches!(e, TraceEvent::Retransmit { .. }))
        .len()
}

// ============================================================================
// ACKs
// ============================================================================

#[test]
fn test_ack_every_five_packets() {
    let mut pair = Pair::new(QbbConfig::default().with_ack_interval(5));
    pair.send_all(0..10);
    pair.run_until(SimTime::from_millis(1));

    assert_eq!(pair.acks(), vec![5, 10]);
    assert!(pair.nacks().is_empty());
    assert_eq!(pair.delivered(), (0..10).collect::<Vec<_>>());
    assert!(pair.a.flow(&flow_key()).unwrap().send_buffer.is_empty());
}

#[test]
fn test_chunk_boundaries_also_ack() {
    let mut pair = Pair::new(
        QbbConfig::default()
            .with_ack_interval(100)
            .with_chunk_size(4),
    );
    pair.send_all(0..12);
    pair.run_until(SimTime::from_millis(1));

    assert_eq!(pair.acks(), vec![4, 8, 12]);
    assert_eq!(pair.delivered().len(), 12);
}

#[test]
fn test_no_acks_when_disabled() {
    let mut pair = Pair::new(QbbConfig::default());
    pair.send_all(0..6);
    pair.run_until(SimTime::from_millis(1));

    assert!(pair.from_b.is_empty());
    assert_eq!(pair.delivered(), (0..6).collect::<Vec<_>>());
    // Nothing trims the buffer without ACKs
    assert_eq!(pair.a.flow(&flow_key()).unwrap().send_buffer.len(), 6);
}

#[test]
fn test_stray_ack_is_ignored() {
    let mut pair = Pair::new(QbbConfig::default());
    pair.send(0);
    pair.run_until(SimTime::from_micros(10));

    let ack = feedback(Frame::Ack(QbbHeader::new(1, PG, SOURCE_PORT)), pair.ctx_a.now());
    pair.a.receive(&mut pair.ctx_a, ack);
    assert_eq!(pair.a.flow(&flow_key()).unwrap().send_buffer.len(), 1);
}

// ============================================================================
// NACK and go-back-N
// ============================================================================

#[test]
fn test_lost_packet_is_nacked_and_replayed() {
    let mut pair = Pair::new(QbbConfig::default().with_ack_interval(5));
    pair.b
        .set_error_model(Box::new(SequenceErrorModel::new([5])));
    pair.send_all(0..10);
    pair.run_until(SimTime::from_millis(1));

    assert_eq!(pair.nacks(), vec![5]);
    assert_eq!(pair.acks(), vec![5, 10]);
    assert_eq!(pair.delivered(), (0..10).collect::<Vec<_>>());
    assert_eq!(
        pair.ctx_b
            .traces_matching(|e| matches!(e, TraceEvent::PhyRxDrop { .. }))
            .len(),
        1
    );
    assert_eq!(retransmits(&pair.ctx_a), 1);
    assert!(pair.a.flow(&flow_key()).unwrap().send_buffer.is_empty());
}

#[test]
fn test_nack_trims_buffer_before_replay() {
    let mut pair = Pair::new(QbbConfig::default().with_ack_interval(100));
    pair.send_all(0..10);
    let sent = run_sender_alone(&mut pair, SimTime::from_millis(1));
    assert_eq!(sent.len(), 10);
    assert_eq!(pair.a.flow(&flow_key()).unwrap().send_buffer.len(), 10);

    let nack = feedback(Frame::Nack(QbbHeader::new(5, PG, SOURCE_PORT)), pair.ctx_a.now());
    pair.a.receive(&mut pair.ctx_a, nack);

    let flow = pair.a.flow(&flow_key()).unwrap();
    assert_eq!(flow.send_buffer.head_seq(), Some(5));
    assert_eq!(flow.send_buffer.len(), 5);

    let replayed = run_sender_alone(&mut pair, SimTime::from_millis(2));
    assert_eq!(replayed, vec![5, 6, 7, 8, 9]);
}

#[test]
fn test_nack_behind_buffer_head_is_abandoned() {
    let mut pair = Pair::new(QbbConfig::default().with_ack_interval(100));
    pair.send_all(0..6);
    run_sender_alone(&mut pair, SimTime::from_millis(1));

    let now = pair.ctx_a.now();
    let ack = feedback(Frame::Ack(QbbHeader::new(4, PG, SOURCE_PORT)), now);
    pair.a.receive(&mut pair.ctx_a, ack);
    assert_eq!(pair.a.flow(&flow_key()).unwrap().send_buffer.head_seq(), Some(4));

    // Packets below 4 are gone, so a NACK for 2 cannot be served
    let nack = feedback(Frame::Nack(QbbHeader::new(2, PG, SOURCE_PORT)), now);
    pair.a.receive(&mut pair.ctx_a, nack);
    assert!(pair.ctx_a.transmitted.is_empty());
    assert_eq!(retransmits(&pair.ctx_a), 0);
}

#[test]
fn test_nack_for_unknown_flow_is_abandoned() {
    let mut pair = Pair::new(QbbConfig::default());
    let nack = feedback(Frame::Nack(QbbHeader::new(5, PG, 9999)), SimTime::ZERO);
    pair.a.receive(&mut pair.ctx_a, nack);

    assert!(pair.ctx_a.transmitted.is_empty());
    assert!(pair.a.flows().is_empty());
}

#[test]
fn test_repeated_gap_is_nacked_once() {
    let mut pair = Pair::new(QbbConfig::default().with_ack_interval(100));
    for seq in [0, 1, 3, 4, 5] {
        let packet = data(seq, pair.ctx_b.now());
        pair.b.receive(&mut pair.ctx_b, packet);
        pair.ctx_b.advance(std::time::Duration::from_micros(1));
    }

    let nacks: Vec<u32> = pair
        .ctx_b
        .take_transmitted()
        .iter()
        .filter_map(|p| match Frame::decode(p) {
            Ok(Frame::Nack(h)) => Some(h.seq),
            _ => None,
        })
        .collect();
    assert_eq!(nacks, vec![2]);
    assert_eq!(pair.b.receiver(&remote_key()).unwrap().expected(), 2);
    assert_eq!(pair.ctx_b.delivered.len(), 2);
}

#[test]
fn test_back_to_zero_rewinds_to_chunk_start() {
    let config = QbbConfig::default()
        .with_ack_interval(100)
        .with_chunk_size(4)
        .with_back_to_zero(true);
    let mut pair = Pair::new(config);
    pair.b
        .set_error_model(Box::new(SequenceErrorModel::new([6])));
    pair.send_all(0..8);
    pair.run_until(SimTime::from_millis(1));

    // The gap at 6 rewinds the receiver to 4, the start of its chunk
    assert_eq!(pair.nacks(), vec![4]);
    assert_eq!(pair.delivered(), vec![0, 1, 2, 3, 4, 5, 4, 5, 6, 7]);
    assert_eq!(pair.acks(), vec![4, 8]);
}

// ============================================================================
// Wait for ACK
// ============================================================================

#[test]
fn test_flow_blocks_at_chunk_until_acked() {
    let mut pair = Pair::new(QbbConfig::reliable(4, 4));
    pair.send_all(0..8);
    pair.run_until(SimTime::from_millis(1));

    assert_eq!(pair.delivered(), (0..8).collect::<Vec<_>>());
    assert_eq!(pair.acks(), vec![4, 8]);

    let flow = pair.a.flow(&flow_key()).unwrap();
    assert_eq!(flow.milestone_tx, 12);
    assert!(!flow.waiting_ack);
    assert_eq!(retransmits(&pair.ctx_a), 0);
}

#[test]
fn test_ack_timeout_retransmits_chunk() {
    let mut pair = Pair::new(QbbConfig::reliable(4, 4));
    pair.send_all(0..4);

    // No ACK ever comes back
    let sent = run_sender_alone(&mut pair, SimTime::from_micros(100));
    assert_eq!(sent, vec![0, 1, 2, 3]);

    let flow = pair.a.flow(&flow_key()).unwrap();
    assert!(flow.waiting_ack);
    assert_eq!(flow.next_avail, SimTime::MAX);

    // Armed when the last packet of the chunk departed, three frames in
    let timeout = pair
        .ctx_a
        .find_timer(|t| matches!(t, DeviceTimer::Retransmit { .. }))
        .unwrap();
    assert_eq!(timeout.at, SimTime::from_nanos(3 * 206 + 500_000));

    let resent = run_sender_alone(&mut pair, SimTime::from_millis(1));
    assert_eq!(resent, vec![0, 1, 2, 3]);
    assert_eq!(
        pair.ctx_a
            .traces_matching(|e| matches!(e, TraceEvent::Retransmit { packets: 4, .. }))
            .len(),
        1
    );
    // Blocked again at the end of the replayed chunk
    assert!(pair.a.flow(&flow_key()).unwrap().waiting_ack);
}

// ============================================================================
// Corruption
// ============================================================================

#[test]
fn test_corrupted_packets_are_not_delivered() {
    let mut pair = Pair::new(QbbConfig::default());
    pair.b.set_error_model(Box::new(RateErrorModel::new(1.0, 7)));
    pair.send_all(0..3);
    pair.run_until(SimTime::from_millis(1));

    assert!(pair.ctx_b.delivered.is_empty());
    assert_eq!(
        pair.ctx_b
            .traces_matching(|e| matches!(e, TraceEvent::PhyRxDrop { .. }))
            .len(),
        3
    );
    assert!(pair.b.receiver(&remote_key()).is_none());
}
