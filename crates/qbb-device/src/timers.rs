//! Owned timer handles
//!
//! A device keeps at most one pending timer per purpose and key. Every
//! reschedule goes through [`TimerSlot::replace`], which cancels whatever the
//! slot held before scheduling the new timer.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use qbb_core::{DeviceContext, DeviceTimer, TimerId};

/// Holder of at most one scheduled timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSlot(Option<TimerId>);

impl TimerSlot {
    pub const fn empty() -> Self {
        Self(None)
    }

    /// Cancel the held timer, if any, and schedule `timer` after `delay`
    pub fn replace(&mut self, ctx: &mut impl DeviceContext, delay: Duration, timer: DeviceTimer) {
        self.cancel(ctx);
        self.0 = Some(ctx.schedule(delay, timer));
    }

    pub fn cancel(&mut self, ctx: &mut impl DeviceContext) {
        if let Some(id) = self.0.take() {
            ctx.cancel(id);
        }
    }

    /// Whether the held timer has yet to fire
    pub fn is_pending(&self, ctx: &impl DeviceContext) -> bool {
        self.0.is_some_and(|id| ctx.is_pending(id))
    }

    pub fn id(&self) -> Option<TimerId> {
        self.0
    }
}

/// Timer slots indexed by key
#[derive(Debug, Clone)]
pub struct TimerTable<K> {
    slots: HashMap<K, TimerSlot>,
}

impl<K> Default for TimerTable<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Copy> TimerTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(
        &mut self,
        ctx: &mut impl DeviceContext,
        key: K,
        delay: Duration,
        timer: DeviceTimer,
    ) {
        self.slots.entry(key).or_default().replace(ctx, delay, timer);
    }

    pub fn cancel(&mut self, ctx: &mut impl DeviceContext, key: K) {
        if let Some(mut slot) = self.slots.remove(&key) {
            slot.cancel(ctx);
        }
    }

    pub fn is_pending(&self, ctx: &impl DeviceContext, key: K) -> bool {
        self.slots.get(&key).is_some_and(|slot| slot.is_pending(ctx))
    }

    pub fn cancel_all(&mut self, ctx: &mut impl DeviceContext) {
        for (_, mut slot) in self.slots.drain() {
            slot.cancel(ctx);
        }
    }
}
