//! UDP traffic applications
//!
//! A [`UdpSender`] emits a fixed number of sequenced data packets at a fixed
//! application rate; a [`UdpSink`] on the receiving host counts what arrives
//! per flow so the network can tell when a flow has completed.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use qbb_core::{
    data_packet, Address, DataRate, FlowKey, Frame, NodeId, Packet, SeqTsHeader, SimTime,
    UdpHeader, IPV4_HEADER_LEN, PPP_HEADER_LEN,
};

use crate::types::AppId;

/// Parameters of one flow
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSpec {
    pub source: NodeId,
    pub destination: NodeId,
    pub source_port: u16,
    pub destination_port: u16,
    pub priority: u8,
    pub packets: u32,
    /// UDP payload bytes per packet
    pub payload_size: u32,
    /// Application sending rate; `None` sends at the host's line rate
    pub rate: Option<DataRate>,
    pub start: SimTime,
}

impl FlowSpec {
    pub fn new(source: NodeId, destination: NodeId, packets: u32) -> Self {
        Self {
            source,
            destination,
            source_port: 4000,
            destination_port: 5000,
            priority: 3,
            packets,
            payload_size: 1000,
            rate: None,
            start: SimTime::ZERO,
        }
    }

    pub fn with_ports(mut self, source_port: u16, destination_port: u16) -> Self {
        self.source_port = source_port;
        self.destination_port = destination_port;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload_size(mut self, bytes: u32) -> Self {
        self.payload_size = bytes;
        self
    }

    pub fn with_rate(mut self, rate: DataRate) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn starting_at(mut self, start: SimTime) -> Self {
        self.start = start;
        self
    }

    /// On-the-wire size of every packet of this flow
    pub fn wire_size(&self) -> u32 {
        PPP_HEADER_LEN
            + IPV4_HEADER_LEN
            + UdpHeader::LEN as u32
            + self.payload_size.max(SeqTsHeader::LEN as u32)
    }

    /// On-the-wire bytes of the whole flow
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.wire_size()) * u64::from(self.packets)
    }
}

/// Sending side of one flow
#[derive(Debug, Clone)]
pub struct UdpSender {
    pub id: AppId,
    pub spec: FlowSpec,
    source: Address,
    destination: Address,
    rate: DataRate,
    next_seq: u32,
}

impl UdpSender {
    pub fn new(
        id: AppId,
        spec: FlowSpec,
        source: Address,
        destination: Address,
        line_rate: DataRate,
    ) -> Self {
        let rate = spec.rate.unwrap_or(line_rate);
        Self {
            id,
            spec,
            source,
            destination,
            rate,
            next_seq: 0,
        }
    }

    /// Key the receiving host files this flow under
    pub fn receiver_key(&self) -> FlowKey {
        FlowKey::new(self.source, self.spec.source_port, self.spec.priority)
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn sent(&self) -> u32 {
        self.next_seq
    }

    pub fn is_done(&self) -> bool {
        self.next_seq >= self.spec.packets
    }

    /// Build the next packet, if any remain
    pub fn next_packet(&mut self, now: SimTime) -> Option<Packet> {
        if self.is_done() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let udp = UdpHeader {
            source_port: self.spec.source_port,
            destination_port: self.spec.destination_port,
        };
        let seq_ts = SeqTsHeader {
            seq,
            ts: now,
            pg: u16::from(self.spec.priority),
        };
        Some(data_packet(
            self.source,
            self.destination,
            udp,
            seq_ts,
            self.spec.payload_size,
            now,
        ))
    }

    /// Gap between two packets of `size` bytes at the application rate
    pub fn interval(&self, size: u32) -> Duration {
        self.rate.tx_time(size)
    }
}

/// What a sink knows about one incoming flow
#[derive(Debug, Clone, Default)]
pub struct SinkFlow {
    seqs: BTreeSet<u32>,
    pub duplicates: u64,
    pub bytes: u64,
    pub first: Option<SimTime>,
    pub last: Option<SimTime>,
}

impl SinkFlow {
    /// Distinct sequence numbers received
    pub fn received(&self) -> u32 {
        self.seqs.len() as u32
    }
}

/// Receiving side of every flow ending at one host
#[derive(Debug, Clone, Default)]
pub struct UdpSink {
    flows: HashMap<FlowKey, SinkFlow>,
    ignored: u64,
}

impl UdpSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a delivered packet; returns its flow and the distinct count
    pub fn receive(&mut self, packet: &Packet, now: SimTime) -> Option<(FlowKey, u32)> {
        let Ok(Frame::Data { udp, seq_ts }) = Frame::decode(packet) else {
            self.ignored += 1;
            return None;
        };
        let priority = u8::try_from(seq_ts.pg).ok()?;
        let key = FlowKey::new(packet.header.source, udp.source_port, priority);
        let flow = self.flows.entry(key).or_default();
        if flow.seqs.insert(seq_ts.seq) {
            flow.bytes += u64::from(packet.size());
        } else {
            flow.duplicates += 1;
        }
        flow.first.get_or_insert(now);
        flow.last = Some(now);
        Some((key, flow.received()))
    }

    pub fn flow(&self, key: &FlowKey) -> Option<&SinkFlow> {
        self.flows.get(key)
    }

    /// Packets received more than once, over every flow
    pub fn duplicates(&self) -> u64 {
        self.flows.values().map(|flow| flow.duplicates).sum()
    }

    /// Delivered packets that were not UDP data
    pub fn ignored(&self) -> u64 {
        self.ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(packets: u32) -> UdpSender {
        UdpSender::new(
            AppId(0),
            FlowSpec::new(NodeId(0), NodeId(1), packets),
            Address::for_node(NodeId(0)),
            Address::for_node(NodeId(1)),
            DataRate::from_gbps(40),
        )
    }

    #[test]
    fn test_sender_emits_exact_count() {
        let mut app = sender(3);
        let seqs: Vec<u32> = std::iter::from_fn(|| app.next_packet(SimTime::ZERO))
            .map(|packet| match Frame::decode(&packet) {
                Ok(Frame::Data { seq_ts, .. }) => seq_ts.seq,
                other => panic!("unexpected frame {:?}", other),
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(app.is_done());
        assert_eq!(app.sent(), 3);
    }

    #[test]
    fn test_sender_paces_at_line_rate() {
        let mut app = sender(1);
        let packet = app.next_packet(SimTime::ZERO).unwrap();
        assert_eq!(packet.size(), 1030);
        assert_eq!(app.spec.wire_size(), 1030);
        assert_eq!(app.spec.total_bytes(), 1030);
        assert_eq!(app.interval(packet.size()), Duration::from_nanos(206));
    }

    #[test]
    fn test_sink_counts_distinct_sequences() {
        let mut app = sender(2);
        let first = app.next_packet(SimTime::ZERO).unwrap();
        let second = app.next_packet(SimTime::ZERO).unwrap();
        let mut sink = UdpSink::new();

        assert_eq!(sink.receive(&first, SimTime::from_micros(1)).map(|(_, n)| n), Some(1));
        assert_eq!(sink.receive(&first, SimTime::from_micros(2)).map(|(_, n)| n), Some(1));
        let (key, count) = sink.receive(&second, SimTime::from_micros(3)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(key, app.receiver_key());

        let flow = sink.flow(&key).unwrap();
        assert_eq!(flow.duplicates, 1);
        assert_eq!(sink.duplicates(), 1);
        assert_eq!(flow.bytes, 2060);
        assert_eq!(flow.first, Some(SimTime::from_micros(1)));
        assert_eq!(flow.last, Some(SimTime::from_micros(3)));
    }
}
