//! Addresses and identifiers
//!
//! - [`Address`]: IPv4-style host address carried in every packet
//! - [`NodeId`] / [`PortIndex`]: where a device lives in the fabric
//! - [`FlowKey`]: the (source, port, priority) triple that names a flow
//! - [`PriorityMask`]: a set of priority classes

use std::fmt;
use std::net::Ipv4Addr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::PRIORITY_COUNT;

/// IPv4-style host address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(u32);

impl Address {
    pub const UNSPECIFIED: Address = Address(0);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(u32::from_be_bytes([a, b, c, d]))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn to_bits(&self) -> u32 {
        self.0
    }

    /// Host address `10.0.x.y` derived from a node number
    pub fn for_node(node: NodeId) -> Self {
        let [_, _, hi, lo] = node.0.to_be_bytes();
        Self::new(10, 0, hi, lo.wrapping_add(1))
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(*self))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Identifier of a node (host or switch) in the fabric
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("n{_0}")]
pub struct NodeId(pub u32);

/// Index of a device (port) on its node
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("p{_0}")]
pub struct PortIndex(pub u32);

impl PortIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Stable index of a flow inside a device's flow table
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("f{_0}")]
pub struct FlowIndex(pub u32);

impl FlowIndex {
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Role of the node that owns a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// End host: runs per-flow rate control and reliable delivery
    Nic,
    /// Switch: runs shared-buffer admission, ECN marking and PFC generation
    Switch,
}

/// Identity of a flow as seen by either end
///
/// The sender keys its flows by (destination, port, priority) it transmits to;
/// the receiver keys its sequence and ECN accounting by the (source, port,
/// priority) it receives from. Both use the same triple shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub address: Address,
    pub port: u16,
    pub priority: u8,
}

impl FlowKey {
    pub fn new(address: Address, port: u16, priority: u8) -> Self {
        Self {
            address,
            port,
            priority,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/q{}", self.address, self.port, self.priority)
    }
}

/// A set of priority classes
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PriorityMask(u16);

impl PriorityMask {
    pub const EMPTY: PriorityMask = PriorityMask(0);

    pub fn single(priority: usize) -> Self {
        let mut mask = Self::EMPTY;
        mask.insert(priority);
        mask
    }

    pub fn insert(&mut self, priority: usize) {
        if priority < PRIORITY_COUNT {
            self.0 |= 1 << priority;
        }
    }

    pub fn remove(&mut self, priority: usize) {
        if priority < PRIORITY_COUNT {
            self.0 &= !(1 << priority);
        }
    }

    pub fn contains(&self, priority: usize) -> bool {
        priority < PRIORITY_COUNT && self.0 & (1 << priority) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Priorities in the set, lowest first
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..PRIORITY_COUNT).filter(move |p| self.contains(*p))
    }
}

impl fmt::Debug for PriorityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<usize> for PriorityMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for p in iter {
            mask.insert(p);
        }
        mask
    }
}
