//! Packets carried over point-to-point links
//!
//! A [`Packet`] is an IPv4-style header plus an encoded payload. The protocol
//! field of the header selects how the payload is decoded (see
//! [`crate::frame::Frame`]). Packets are cheap to clone: the payload is a
//! reference-counted [`Bytes`] buffer and copies keep the same uid, so a packet
//! replayed from a send buffer is still recognizable in traces.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{Address, PortIndex};
use crate::time::SimTime;

/// Reserved protocol numbers
pub mod protocol {
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    /// Positive acknowledgement of a reliable flow
    pub const ACK: u8 = 0xFC;
    /// Negative acknowledgement (go-back-N request)
    pub const NACK: u8 = 0xFD;
    /// Priority flow control pause/resume
    pub const PFC: u8 = 0xFE;
    /// Congestion notification (QCN/CNP feedback)
    pub const QCN: u8 = 0xFF;
}

/// Link-layer (PPP) header length in bytes
pub const PPP_HEADER_LEN: u32 = 2;
/// Network-layer header length in bytes
pub const IPV4_HEADER_LEN: u32 = 20;

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// ECN codepoint of the IPv4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Ecn {
    #[default]
    NotEct,
    Ect1,
    Ect0,
    /// Congestion experienced
    Ce,
}

impl Ecn {
    pub fn bits(&self) -> u8 {
        match self {
            Ecn::NotEct => 0b00,
            Ecn::Ect1 => 0b01,
            Ecn::Ect0 => 0b10,
            Ecn::Ce => 0b11,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0b00 => Ok(Ecn::NotEct),
            0b01 => Ok(Ecn::Ect1),
            0b10 => Ok(Ecn::Ect0),
            0b11 => Ok(Ecn::Ce),
            other => Err(ProtocolError::InvalidEcn(other)),
        }
    }
}

/// IPv4-style network header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Header {
    pub source: Address,
    pub destination: Address,
    pub protocol: u8,
    pub ecn: Ecn,
    pub ttl: u8,
}

impl Ipv4Header {
    pub fn new(source: Address, destination: Address, protocol: u8) -> Self {
        Self {
            source,
            destination,
            protocol,
            ecn: Ecn::NotEct,
            ttl: 64,
        }
    }
}

/// A packet in flight or queued on a device
#[derive(Debug, Clone)]
pub struct Packet {
    uid: u64,
    pub header: Ipv4Header,
    pub payload: Bytes,
    /// Application bytes not materialized in `payload`
    pub padding: u32,
    /// Ingress port a switch received this packet on
    pub ingress_port: Option<PortIndex>,
    /// When the packet was created by its application
    pub created_at: SimTime,
}

impl Packet {
    pub fn new(header: Ipv4Header, payload: Bytes, padding: u32, created_at: SimTime) -> Self {
        Self {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            header,
            payload,
            padding,
            ingress_port: None,
            created_at,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    /// On-the-wire size including link and network headers
    pub fn size(&self) -> u32 {
        PPP_HEADER_LEN + IPV4_HEADER_LEN + self.payload.len() as u32 + self.padding
    }

    pub fn is_ecn_capable(&self) -> bool {
        self.header.ecn != Ecn::NotEct
    }

    pub fn set_ecn(&mut self, ecn: Ecn) {
        self.header.ecn = ecn;
    }

    pub fn with_ingress_port(mut self, port: PortIndex) -> Self {
        self.ingress_port = Some(port);
        self
    }
}
