//! # QBB Device
//!
//! Lossless Ethernet device model: priority flow control, QCN/DCQCN rate
//! control, ECN marking, shared-buffer admission and go-back-N reliable
//! delivery.
//!
//! The device is driven entirely through [`qbb_core::DeviceContext`]: it
//! never owns a clock, a channel or a node. A discrete-event harness calls
//! [`QbbNetDevice::send`], [`QbbNetDevice::receive`] and
//! [`QbbNetDevice::on_timer`], and the device answers by scheduling timers,
//! starting transmissions and emitting trace events.
//!
//! ## Key Types
//!
//! - [`QbbNetDevice`]: One NIC or switch port
//! - [`QbbConfig`]: Every tunable of a device, with DCQCN defaults
//! - [`SharedBuffer`]: Switch MMU implementing [`qbb_core::AdmissionControl`]
//! - [`EgressQueue`]: Per-class FIFOs with strict, rate-limited and round-robin selection
//! - [`FlowRate`]: Per-flow QCN reaction point
//! - [`ReceiverState`] / [`SendBuffer`]: The two halves of reliable delivery
//!
//! ## Example
//!
//! ```rust,ignore
//! use qbb_core::{Address, MockContext, NodeId, NodeRole, PortIndex};
//! use qbb_device::{QbbConfig, QbbNetDevice};
//!
//! let mut device = QbbNetDevice::new(
//!     NodeId(0),
//!     PortIndex(0),
//!     NodeRole::Nic,
//!     Address::new(10, 0, 0, 1),
//!     QbbConfig::dcqcn(),
//! )?;
//! let mut ctx = MockContext::new();
//! device.send(&mut ctx, packet);
//! while let Some(timer) = ctx.pop_next() {
//!     device.on_timer(&mut ctx, timer);
//! }
//! ```

pub mod config;
pub mod device;
pub mod ecn;
pub mod error;
pub mod flows;
pub mod link;
pub mod mmu;
pub mod queue;
pub mod rate;
pub mod reliable;
pub mod timers;

pub use config::{EcnVariant, QbbConfig};
pub use device::QbbNetDevice;
pub use ecn::{ClassMarker, EcnAccount, EcnFeedback, RootEcnParams, RootState};
pub use error::{DeviceError, DeviceResult};
pub use flows::{FlowRecord, FlowTable};
pub use link::{InFlight, TxMachine, TxState};
pub use mmu::{BufferConfig, SharedBuffer, CELL_SIZE};
pub use queue::{EgressQueue, RateGate, CONTROL_CLASS, QCN_CONTROL_CLASS};
pub use rate::{ClampPolicy, FlowRate, HopState, RateParams, RpStage};
pub use reliable::{chunk_floor, AckPolicy, ReceiverState, SendBuffer, SeqOutcome};
pub use timers::{TimerSlot, TimerTable};
