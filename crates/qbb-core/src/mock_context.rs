//! Mock device context for testing
//!
//! Records every side effect a device performs so tests can assert on it,
//! and keeps a manual clock with a pending-timer table that tests drive by
//! popping timers in firing order.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use qbb_core::{DeviceTimer, MockContext};
//!
//! let mut ctx = MockContext::new();
//! device.send(&mut ctx, packet);
//! assert_eq!(ctx.transmitted.len(), 1);
//!
//! // Fire timers in order until the device goes quiet
//! while let Some(timer) = ctx.pop_next() {
//!     device.on_timer(&mut ctx, timer);
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use crate::event::TraceEvent;
use crate::identity::PortIndex;
use crate::packet::Packet;
use crate::time::SimTime;
use crate::traits::{AdmissionControl, DeviceContext, DeviceTimer, TimerId};

/// A timer waiting in a [`MockContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub id: TimerId,
    pub at: SimTime,
    pub timer: DeviceTimer,
}

/// In-memory [`DeviceContext`] with a manual clock
pub struct MockContext {
    now: SimTime,
    next_timer: u64,
    /// Pending timers keyed by (fire time, id) so iteration is firing order
    timers: BTreeMap<(SimTime, TimerId), DeviceTimer>,
    admission: Option<Box<dyn AdmissionControl>>,
    refuse_transmit: bool,
    /// Packets handed to the channel, with their serialization time
    pub transmitted: Vec<(Packet, Duration)>,
    /// Packets handed to the node
    pub delivered: Vec<Packet>,
    /// Packets the device asked the node to send on another port
    pub port_sends: Vec<(PortIndex, Packet)>,
    /// Trace events with the time they were recorded
    pub traces: Vec<(SimTime, TraceEvent)>,
}

impl Default for MockContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContext {
    /// Create a context at time zero with no admission controller
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_timer: 1,
            timers: BTreeMap::new(),
            admission: None,
            refuse_transmit: false,
            transmitted: Vec::new(),
            delivered: Vec::new(),
            port_sends: Vec::new(),
            traces: Vec::new(),
        }
    }

    /// Attach a shared-buffer controller, making the context look like a switch
    pub fn with_admission(mut self, admission: Box<dyn AdmissionControl>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Make subsequent `transmit_start` calls fail
    pub fn refuse_transmissions(&mut self, refuse: bool) {
        self.refuse_transmit = refuse;
    }

    pub fn set_now(&mut self, now: SimTime) {
        self.now = now;
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Pending timers in firing order
    pub fn pending(&self) -> Vec<ScheduledTimer> {
        self.timers
            .iter()
            .map(|(&(at, id), &timer)| ScheduledTimer { id, at, timer })
            .collect()
    }

    /// First pending timer matching `pred`
    pub fn find_timer(&self, pred: impl Fn(&DeviceTimer) -> bool) -> Option<ScheduledTimer> {
        self.pending().into_iter().find(|t| pred(&t.timer))
    }

    /// Number of pending timers matching `pred`
    pub fn count_timers(&self, pred: impl Fn(&DeviceTimer) -> bool) -> usize {
        self.timers.values().filter(|t| pred(t)).count()
    }

    /// Remove the earliest pending timer, advancing the clock to its fire time
    pub fn pop_next(&mut self) -> Option<DeviceTimer> {
        let (&(at, id), _) = self.timers.iter().next()?;
        let timer = self.timers.remove(&(at, id))?;
        if at > self.now {
            self.now = at;
        }
        Some(timer)
    }

    /// Like [`MockContext::pop_next`] but only for timers due at or before `limit`
    pub fn pop_next_until(&mut self, limit: SimTime) -> Option<DeviceTimer> {
        let (&(at, _), _) = self.timers.iter().next()?;
        if at > limit {
            return None;
        }
        self.pop_next()
    }

    /// Drain recorded transmissions
    pub fn take_transmitted(&mut self) -> Vec<Packet> {
        self.transmitted.drain(..).map(|(p, _)| p).collect()
    }

    /// Recorded trace events matching `pred`
    pub fn traces_matching(&self, pred: impl Fn(&TraceEvent) -> bool) -> Vec<TraceEvent> {
        self.traces
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Read access to the attached admission controller
    pub fn admission_ref(&self) -> Option<&dyn AdmissionControl> {
        self.admission.as_deref()
    }
}

impl DeviceContext for MockContext {
    fn now(&self) -> SimTime {
        self.now
    }

    fn schedule(&mut self, delay: Duration, timer: DeviceTimer) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert((self.now + delay, id), timer);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.timers.retain(|&(_, tid), _| tid != id);
    }

    fn is_pending(&self, id: TimerId) -> bool {
        self.timers.keys().any(|&(_, tid)| tid == id)
    }

    fn transmit_start(&mut self, packet: Packet, tx_time: Duration) -> bool {
        if self.refuse_transmit {
            return false;
        }
        self.transmitted.push((packet, tx_time));
        true
    }

    fn deliver_up(&mut self, packet: Packet) {
        self.delivered.push(packet);
    }

    fn send_on_port(&mut self, port: PortIndex, packet: Packet) {
        self.port_sends.push((port, packet));
    }

    fn admission(&mut self) -> Option<&mut dyn AdmissionControl> {
        match self.admission.as_mut() {
            Some(admission) => Some(admission.as_mut()),
            None => None,
        }
    }

    fn trace(&mut self, event: TraceEvent) {
        self.traces.push((self.now, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FlowIndex;

    #[test]
    fn test_timers_fire_in_order() {
        let mut ctx = MockContext::new();
        ctx.schedule(Duration::from_micros(10), DeviceTimer::Sample);
        ctx.schedule(Duration::from_micros(5), DeviceTimer::NextSend);
        ctx.schedule(Duration::from_micros(5), DeviceTimer::TransmitComplete);

        assert_eq!(ctx.pop_next(), Some(DeviceTimer::NextSend));
        assert_eq!(ctx.now(), SimTime::from_micros(5));
        assert_eq!(ctx.pop_next(), Some(DeviceTimer::TransmitComplete));
        assert_eq!(ctx.pop_next_until(SimTime::from_micros(8)), None);
        assert_eq!(ctx.pop_next(), Some(DeviceTimer::Sample));
        assert_eq!(ctx.now(), SimTime::from_micros(10));
        assert_eq!(ctx.pop_next(), None);
    }

    #[test]
    fn test_cancel() {
        let mut ctx = MockContext::new();
        let id = ctx.schedule(
            Duration::from_micros(1),
            DeviceTimer::Retransmit { flow: FlowIndex(0) },
        );
        assert!(ctx.is_pending(id));
        ctx.cancel(id);
        assert!(!ctx.is_pending(id));
        ctx.cancel(id);
        assert!(ctx.pending().is_empty());
    }

    #[test]
    fn test_refused_transmission() {
        use crate::identity::Address;
        use crate::packet::{protocol, Ipv4Header};

        let mut ctx = MockContext::new();
        let packet = Packet::new(
            Ipv4Header::new(Address::new(10, 0, 0, 1), Address::new(10, 0, 0, 2), protocol::UDP),
            bytes::Bytes::new(),
            100,
            SimTime::ZERO,
        );
        ctx.refuse_transmissions(true);
        assert!(!ctx.transmit_start(packet.clone(), Duration::ZERO));
        ctx.refuse_transmissions(false);
        assert!(ctx.transmit_start(packet, Duration::ZERO));
        assert_eq!(ctx.take_transmitted().len(), 1);
        assert!(ctx.transmitted.is_empty());
    }
}
