//! Frame headers and the closed set of frame kinds
//!
//! Every packet on the fabric is one of a small number of kinds, selected by
//! the reserved protocol numbers in [`crate::packet::protocol`]. [`Frame::decode`]
//! turns a packet into exactly one [`Frame`] variant so that devices dispatch
//! with a `match` instead of comparing protocol numbers.
//!
//! ## Wire layouts (big endian)
//!
//! | Kind        | Layout                                                   |
//! |-------------|----------------------------------------------------------|
//! | PFC         | time_us:u32, qlen:u32, priority:u8                       |
//! | QCN         | port:u16, priority:u8, ecn_bits:u8, qfb:u16, total:u16   |
//! | ACK / NACK  | seq:u32, priority:u16, port:u16                          |
//! | UDP data    | sport:u16, dport:u16, len:u16, csum:u16, seq:u32, ts:u64, pg:u16 |

use bytes::{Buf, BufMut, BytesMut};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::Address;
use crate::packet::{protocol, Ipv4Header, Packet};
use crate::time::SimTime;

fn ensure_len(kind: &'static str, buf: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if buf.len() < expected {
        return Err(ProtocolError::Truncated {
            kind,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// PFC pause (or resume, when `time_us` is zero) for one priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseHeader {
    pub time_us: u32,
    /// Queue length at the sender when the frame was generated
    pub qlen: u32,
    pub priority: u8,
}

impl PauseHeader {
    pub const LEN: usize = 9;

    pub fn new(time_us: u32, qlen: u32, priority: u8) -> Self {
        Self {
            time_us,
            qlen,
            priority,
        }
    }

    pub fn is_resume(&self) -> bool {
        self.time_us == 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.time_us);
        buf.put_u32(self.qlen);
        buf.put_u8(self.priority);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("pause", buf, Self::LEN)?;
        Ok(Self {
            time_us: buf.get_u32(),
            qlen: buf.get_u32(),
            priority: buf.get_u8(),
        })
    }
}

/// Congestion notification sent by a receiver back to the flow's source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnHeader {
    pub flow_port: u16,
    pub priority: u8,
    /// OR of the ECN bits seen since the last notification
    pub ecn_bits: u8,
    /// Number of marked packets seen
    pub qfb: u16,
    /// Number of packets seen
    pub total: u16,
}

impl CnHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.flow_port);
        buf.put_u8(self.priority);
        buf.put_u8(self.ecn_bits);
        buf.put_u16(self.qfb);
        buf.put_u16(self.total);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("congestion", buf, Self::LEN)?;
        Ok(Self {
            flow_port: buf.get_u16(),
            priority: buf.get_u8(),
            ecn_bits: buf.get_u8(),
            qfb: buf.get_u16(),
            total: buf.get_u16(),
        })
    }

    /// Marked fraction reported by this notification
    pub fn fraction(&self) -> f64 {
        f64::from(self.qfb) / (f64::from(self.total) + 1.0)
    }
}

/// ACK/NACK payload: the receiver's next expected sequence for a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QbbHeader {
    pub seq: u32,
    pub priority: u16,
    pub port: u16,
}

impl QbbHeader {
    pub const LEN: usize = 8;

    pub fn new(seq: u32, priority: u16, port: u16) -> Self {
        Self {
            seq,
            priority,
            port,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seq);
        buf.put_u16(self.priority);
        buf.put_u16(self.port);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("ack", buf, Self::LEN)?;
        Ok(Self {
            seq: buf.get_u32(),
            priority: buf.get_u16(),
            port: buf.get_u16(),
        })
    }
}

/// UDP ports of a data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
}

impl UdpHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut impl BufMut, payload_len: u16) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u16(payload_len.saturating_add(Self::LEN as u16));
        buf.put_u16(0);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("udp", *buf, Self::LEN)?;
        let header = Self {
            source_port: buf.get_u16(),
            destination_port: buf.get_u16(),
        };
        buf.advance(4);
        Ok(header)
    }
}

/// Sequence number, send timestamp and priority group of a data packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqTsHeader {
    pub seq: u32,
    pub ts: SimTime,
    pub pg: u16,
}

impl SeqTsHeader {
    pub const LEN: usize = 14;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.seq);
        buf.put_u64(self.ts.as_nanos());
        buf.put_u16(self.pg);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("seq-ts", *buf, Self::LEN)?;
        Ok(Self {
            seq: buf.get_u32(),
            ts: SimTime::from_nanos(buf.get_u64()),
            pg: buf.get_u16(),
        })
    }
}

/// Discriminant of a [`Frame`], used in logs and traces
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    #[display("pfc")]
    Pause,
    #[display("qcn")]
    Congestion,
    #[display("nack")]
    Nack,
    #[display("ack")]
    Ack,
    #[display("data")]
    Data,
    #[display("other")]
    Other,
}

/// A decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Pause(PauseHeader),
    Congestion(CnHeader),
    Nack(QbbHeader),
    Ack(QbbHeader),
    Data { udp: UdpHeader, seq_ts: SeqTsHeader },
    /// Any protocol the device does not interpret (e.g. TCP)
    Other,
}

impl Frame {
    /// Decode the payload of `packet` according to its protocol number
    pub fn decode(packet: &Packet) -> Result<Frame, ProtocolError> {
        let mut buf: &[u8] = &packet.payload;
        match packet.protocol() {
            protocol::PFC => Ok(Frame::Pause(PauseHeader::decode(buf)?)),
            protocol::QCN => Ok(Frame::Congestion(CnHeader::decode(buf)?)),
            protocol::NACK => Ok(Frame::Nack(QbbHeader::decode(buf)?)),
            protocol::ACK => Ok(Frame::Ack(QbbHeader::decode(buf)?)),
            protocol::UDP => {
                let udp = UdpHeader::decode(&mut buf)?;
                let seq_ts = SeqTsHeader::decode(&mut buf)?;
                Ok(Frame::Data { udp, seq_ts })
            }
            _ => Ok(Frame::Other),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Pause(_) => FrameKind::Pause,
            Frame::Congestion(_) => FrameKind::Congestion,
            Frame::Nack(_) => FrameKind::Nack,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Other => FrameKind::Other,
        }
    }

    /// Protocol number this frame travels under
    pub fn protocol(&self) -> u8 {
        match self {
            Frame::Pause(_) => protocol::PFC,
            Frame::Congestion(_) => protocol::QCN,
            Frame::Nack(_) => protocol::NACK,
            Frame::Ack(_) => protocol::ACK,
            Frame::Data { .. } => protocol::UDP,
            Frame::Other => protocol::TCP,
        }
    }

    /// Control frames bypass admission, pausing and rate limiting
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Frame::Pause(_) | Frame::Congestion(_) | Frame::Nack(_) | Frame::Ack(_)
        )
    }

    /// Build a control packet carrying this frame
    ///
    /// PFC frames get a TTL of one since they never leave the link they were
    /// generated on. Data frames are built with [`data_packet`] instead.
    pub fn to_packet(&self, source: Address, destination: Address, now: SimTime) -> Packet {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Frame::Pause(h) => h.encode(&mut buf),
            Frame::Congestion(h) => h.encode(&mut buf),
            Frame::Nack(h) | Frame::Ack(h) => h.encode(&mut buf),
            Frame::Data { udp, seq_ts } => {
                udp.encode(&mut buf, SeqTsHeader::LEN as u16);
                seq_ts.encode(&mut buf);
            }
            Frame::Other => {}
        }
        let mut header = Ipv4Header::new(source, destination, self.protocol());
        if matches!(self, Frame::Pause(_)) {
            header.ttl = 1;
        }
        Packet::new(header, buf.freeze(), 0, now)
    }
}

/// Build a UDP data packet whose UDP payload is `payload_size` bytes
///
/// The sequence header is part of the payload; the rest is padding.
pub fn data_packet(
    source: Address,
    destination: Address,
    udp: UdpHeader,
    seq_ts: SeqTsHeader,
    payload_size: u32,
    now: SimTime,
) -> Packet {
    let mut buf = BytesMut::with_capacity(UdpHeader::LEN + SeqTsHeader::LEN);
    let udp_payload = payload_size.max(SeqTsHeader::LEN as u32);
    udp.encode(&mut buf, u16::try_from(udp_payload).unwrap_or(u16::MAX));
    seq_ts.encode(&mut buf);
    let padding = udp_payload - SeqTsHeader::LEN as u32;
    let header = Ipv4Header::new(source, destination, protocol::UDP);
    Packet::new(header, buf.freeze(), padding, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn a() -> Address {
        Address::new(10, 0, 0, 1)
    }

    fn b() -> Address {
        Address::new(10, 0, 0, 2)
    }

    #[test]
    fn test_decode_control_frames() {
        let frames = [
            Frame::Pause(PauseHeader::new(100, 4096, 3)),
            Frame::Congestion(CnHeader {
                flow_port: 4001,
                priority: 3,
                ecn_bits: 0b11,
                qfb: 7,
                total: 20,
            }),
            Frame::Nack(QbbHeader::new(5, 3, 4001)),
            Frame::Ack(QbbHeader::new(10, 3, 4001)),
        ];
        for frame in frames {
            let packet = frame.to_packet(a(), b(), SimTime::ZERO);
            assert!(frame.is_control());
            assert_eq!(Frame::decode(&packet).unwrap(), frame);
        }
    }

    #[test]
    fn test_pause_frame_is_link_local() {
        let packet = Frame::Pause(PauseHeader::new(0, 0, 1)).to_packet(a(), b(), SimTime::ZERO);
        assert_eq!(packet.header.ttl, 1);
        match Frame::decode(&packet).unwrap() {
            Frame::Pause(h) => assert!(h.is_resume()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_data_packet_layout() {
        let udp = UdpHeader {
            source_port: 4001,
            destination_port: 5001,
        };
        let seq_ts = SeqTsHeader {
            seq: 9,
            ts: SimTime::from_micros(3),
            pg: 3,
        };
        let packet = data_packet(a(), b(), udp, seq_ts, 1000, SimTime::from_micros(3));
        assert_eq!(packet.size(), 2 + 20 + 8 + 1000);
        assert!(!packet.is_ecn_capable());
        assert_eq!(
            Frame::decode(&packet).unwrap(),
            Frame::Data { udp, seq_ts }
        );
        assert!(!Frame::decode(&packet).unwrap().is_control());
    }

    #[test]
    fn test_unknown_protocol_is_other() {
        let packet = Packet::new(
            Ipv4Header::new(a(), b(), protocol::TCP),
            Bytes::new(),
            500,
            SimTime::ZERO,
        );
        let frame = Frame::decode(&packet).unwrap();
        assert_eq!(frame, Frame::Other);
        assert_eq!(frame.kind().to_string(), "other");
    }

    #[test]
    fn test_truncated_header() {
        let packet = Packet::new(
            Ipv4Header::new(a(), b(), protocol::PFC),
            Bytes::from_static(&[0, 0, 1]),
            0,
            SimTime::ZERO,
        );
        let err = Frame::decode(&packet).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                kind: "pause",
                expected: 9,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_cn_fraction() {
        let cn = CnHeader {
            flow_port: 1,
            priority: 1,
            ecn_bits: 3,
            qfb: 5,
            total: 9,
        };
        assert!((cn.fraction() - 0.5).abs() < 1e-12);
    }
}
