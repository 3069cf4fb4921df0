//! # QBB Core
//!
//! Core types, frames, traits, and errors for the QBB lossless fabric.
//!
//! This crate provides the foundational abstractions shared by the device model
//! and the discrete-event harness that drives it. A device never talks to a
//! scheduler or a channel directly; it goes through [`DeviceContext`], which the
//! simulation implements for real runs and [`MockContext`] implements for tests.
//!
//! ## Key Traits
//!
//! - [`DeviceContext`]: Clock, timers, channel and upper-layer hand-off for one device
//! - [`AdmissionControl`]: Shared-buffer admission and pause/ECN decisions of a switch
//! - [`ErrorModel`]: Receive-side corruption model ([`RateErrorModel`], [`ListErrorModel`], [`SequenceErrorModel`])
//!
//! ## Key Types
//!
//! - [`SimTime`] / [`DataRate`]: Virtual time and link speeds
//! - [`FlowKey`]: Identity of a flow (source, port, priority)
//! - [`Packet`]: An IPv4-like packet carried over a point-to-point link
//! - [`Frame`]: Closed set of frame kinds decoded from a packet
//! - [`TraceEvent`]: Observability points emitted by devices

pub mod error;
pub mod error_model;
pub mod event;
pub mod frame;
pub mod identity;
pub mod mock_context;
pub mod packet;
pub mod time;
pub mod traits;

// Re-export main types
pub use error::*;
pub use error_model::*;
pub use event::*;
pub use frame::*;
pub use identity::*;
pub use mock_context::*;
pub use packet::*;
pub use time::*;
pub use traits::*;

/// Number of priority classes on every port
pub const PRIORITY_COUNT: usize = 8;
