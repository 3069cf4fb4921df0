//! Link transmit state machine
//!
//! One packet is on the wire at a time. [`TxMachine::begin`] moves the link
//! from `Ready` to `Busy`; [`TxMachine::complete`] moves it back once the
//! serialization timer fires. Calling either in the wrong state is a bug in
//! the device and panics.

use std::time::Duration;

use qbb_core::{DataRate, Packet};

/// Transmit state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxState {
    #[default]
    Ready,
    Busy,
}

/// The packet currently being serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub uid: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TxMachine {
    state: TxState,
    current: Option<InFlight>,
}

impl TxMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state == TxState::Busy
    }

    pub fn current(&self) -> Option<InFlight> {
        self.current
    }

    /// Occupy the link with `packet`; returns its serialization time at `rate`
    pub fn begin(&mut self, packet: &Packet, rate: DataRate) -> Duration {
        assert_eq!(self.state, TxState::Ready, "transmit started while link busy");
        self.state = TxState::Busy;
        self.current = Some(InFlight {
            uid: packet.uid(),
            size: packet.size(),
        });
        rate.tx_time(packet.size())
    }

    /// Release the link and hand back the packet that finished
    pub fn complete(&mut self) -> Option<InFlight> {
        assert_eq!(self.state, TxState::Busy, "transmit completed while link ready");
        self.state = TxState::Ready;
        self.current.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use qbb_core::{protocol, Address, Ipv4Header, SimTime};

    fn packet() -> Packet {
        Packet::new(
            Ipv4Header::new(Address::new(10, 0, 0, 1), Address::new(10, 0, 0, 2), protocol::UDP),
            Bytes::new(),
            978,
            SimTime::ZERO,
        )
    }

    #[test]
    fn test_cycle() {
        let mut tx = TxMachine::new();
        let p = packet();
        let time = tx.begin(&p, DataRate::from_gbps(1));
        assert_eq!(time, Duration::from_nanos(8_000));
        assert!(tx.is_busy());
        assert_eq!(tx.current().map(|f| f.uid), Some(p.uid()));

        let done = tx.complete().unwrap();
        assert_eq!(done.size, 1000);
        assert_eq!(tx.state(), TxState::Ready);
        assert!(tx.current().is_none());
    }

    #[test]
    #[should_panic(expected = "busy")]
    fn test_begin_while_busy_panics() {
        let mut tx = TxMachine::new();
        tx.begin(&packet(), DataRate::from_gbps(1));
        tx.begin(&packet(), DataRate::from_gbps(1));
    }

    #[test]
    #[should_panic(expected = "ready")]
    fn test_complete_while_ready_panics() {
        TxMachine::new().complete();
    }
}
