//! Discrete-event scheduler
//!
//! Events are ordered by firing time; events scheduled for the same instant
//! fire in the order they were scheduled. Cancelling an event removes its
//! payload, and the stale heap entry is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use qbb_core::SimTime;
use serde::{Deserialize, Serialize};

/// Handle of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Priority queue of future events with a virtual clock
#[derive(Debug)]
pub struct Scheduler<E> {
    now: SimTime,
    next_id: u64,
    queue: BinaryHeap<Reverse<(SimTime, EventId)>>,
    events: HashMap<EventId, E>,
    fired: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_id: 1,
            queue: BinaryHeap::new(),
            events: HashMap::new(),
            fired: 0,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule `event` at absolute time `at`; times in the past fire now
    pub fn schedule_at(&mut self, at: SimTime, event: E) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let at = at.max(self.now);
        self.queue.push(Reverse((at, id)));
        self.events.insert(id, event);
        id
    }

    /// Schedule `event` after `delay`
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        self.schedule_at(self.now + delay, event)
    }

    /// Cancel a pending event; returns whether it was still pending
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.events.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.events.contains_key(&id)
    }

    /// Firing time of the next live event
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_cancelled();
        self.queue.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove the next live event and advance the clock to it
    pub fn pop(&mut self) -> Option<(SimTime, EventId, E)> {
        while let Some(Reverse((at, id))) = self.queue.pop() {
            if let Some(event) = self.events.remove(&id) {
                self.now = at;
                self.fired += 1;
                return Some((at, id, event));
            }
        }
        None
    }

    /// Pop the next event only if it fires at or before `limit`
    pub fn pop_until(&mut self, limit: SimTime) -> Option<(SimTime, EventId, E)> {
        match self.peek_time() {
            Some(at) if at <= limit => self.pop(),
            _ => None,
        }
    }

    /// Move the clock forward without firing anything
    pub fn advance_to(&mut self, at: SimTime) {
        self.now = self.now.max(at);
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events fired since creation
    pub fn fired(&self) -> u64 {
        self.fired
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.queue.peek() {
            if self.events.contains_key(id) {
                break;
            }
            self.queue.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_time_order() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Duration::from_nanos(30), "c");
        scheduler.schedule(Duration::from_nanos(10), "a");
        scheduler.schedule(Duration::from_nanos(20), "b");

        let order: Vec<_> = std::iter::from_fn(|| scheduler.pop().map(|(_, _, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(scheduler.now(), SimTime::from_nanos(30));
        assert_eq!(scheduler.fired(), 3);
    }

    #[test]
    fn test_same_instant_is_fifo() {
        let mut scheduler = Scheduler::new();
        for i in 0..5 {
            scheduler.schedule(Duration::from_micros(1), i);
        }
        let order: Vec<_> = std::iter::from_fn(|| scheduler.pop().map(|(_, _, e)| e)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_events_never_fire() {
        let mut scheduler = Scheduler::new();
        let first = scheduler.schedule(Duration::from_nanos(1), 1);
        scheduler.schedule(Duration::from_nanos(2), 2);

        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert!(!scheduler.is_pending(first));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.peek_time(), Some(SimTime::from_nanos(2)));
        assert_eq!(scheduler.pop().map(|(_, _, e)| e), Some(2));
        assert!(scheduler.pop().is_none());
    }

    #[test]
    fn test_pop_until_respects_limit() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Duration::from_micros(5), ());
        assert!(scheduler.pop_until(SimTime::from_micros(4)).is_none());
        assert_eq!(scheduler.now(), SimTime::ZERO);
        assert!(scheduler.pop_until(SimTime::from_micros(5)).is_some());
    }

    #[test]
    fn test_past_events_fire_now() {
        let mut scheduler = Scheduler::new();
        scheduler.advance_to(SimTime::from_micros(10));
        scheduler.schedule_at(SimTime::from_micros(1), ());
        let (at, _, _) = scheduler.pop().unwrap();
        assert_eq!(at, SimTime::from_micros(10));
    }
}
