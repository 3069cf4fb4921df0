//! Node context injection for simulation logging
//!
//! Every device event in a simulation runs on behalf of one node at one
//! simulated instant. [`NodeContextGuard`] records both in thread-local storage
//! and enters a `node` span carrying them, so every log line emitted in that
//! scope names the node and the virtual time instead of the wall clock alone.

use std::cell::RefCell;

use qbb_core::{NodeId, NodeRole, SimTime};
use tracing::span::EnteredSpan;
use uuid::Uuid;

/// Node context stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContextData {
    pub node: NodeId,
    pub role: NodeRole,
    /// Simulated time of the event being processed
    pub sim_time: SimTime,
    /// Unique id of the simulation run this node belongs to
    pub instance_id: Uuid,
}

/// Short name of a role for log fields
pub fn role_name(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Nic => "nic",
        NodeRole::Switch => "switch",
    }
}

thread_local! {
    static NODE_CONTEXT: RefCell<Option<NodeContextData>> = const { RefCell::new(None) };
}

/// RAII guard for node context
///
/// Creating the guard sets the node context for the current thread and enters
/// a `node` span; dropping it restores the previous context.
///
/// # Example
///
/// ```ignore
/// use qbb_logging::NodeContextGuard;
///
/// let guard = NodeContextGuard::new(NodeId(3), NodeRole::Switch, instance_id);
/// guard.set_time(now);
/// tracing::debug!("Admission refused packet"); // carries node = n3, sim_time_ns
/// ```
pub struct NodeContextGuard {
    previous: Option<NodeContextData>,
    span: EnteredSpan,
}

impl NodeContextGuard {
    pub fn new(node: NodeId, role: NodeRole, instance_id: Uuid) -> Self {
        Self::at(node, role, instance_id, SimTime::ZERO)
    }

    /// Guard for an event at simulated time `now`
    pub fn at(node: NodeId, role: NodeRole, instance_id: Uuid, now: SimTime) -> Self {
        let previous = NODE_CONTEXT.with(|ctx| ctx.borrow().clone());
        NODE_CONTEXT.with(|ctx| {
            *ctx.borrow_mut() = Some(NodeContextData {
                node,
                role,
                sim_time: now,
                instance_id,
            })
        });

        // ERROR level so level filters never strip the context off lower-level events
        let span = tracing::error_span!(
            "node",
            node = %node,
            role = role_name(role),
            sim_time_ns = now.as_nanos(),
        )
        .entered();

        Self { previous, span }
    }

    /// Advance the simulated time reported by this scope
    pub fn set_time(&self, now: SimTime) {
        NODE_CONTEXT.with(|ctx| {
            if let Some(data) = ctx.borrow_mut().as_mut() {
                data.sim_time = now;
            }
        });
        self.span.record("sim_time_ns", now.as_nanos());
    }

    /// Current node context, if any
    pub fn current() -> Option<NodeContextData> {
        NODE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_node() -> Option<NodeId> {
        Self::current().map(|ctx| ctx.node)
    }

    pub fn current_time() -> Option<SimTime> {
        Self::current().map(|ctx| ctx.sim_time)
    }
}

impl Drop for NodeContextGuard {
    fn drop(&mut self) {
        NODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run `$body` with a node context in place
///
/// # Example
///
/// ```ignore
/// with_node_context!(NodeId(0), NodeRole::Nic, run_id, now, {
///     device.on_timer(&mut ctx, timer);
/// });
/// ```
#[macro_export]
macro_rules! with_node_context {
    ($node:expr, $role:expr, $instance:expr, $now:expr, $body:block) => {{
        let _guard = $crate::context::NodeContextGuard::at($node, $role, $instance, $now);
        $body
    }};
}
