//! # QBB Fabric Simulation
//!
//! Discrete-event simulation of a lossless Ethernet fabric built from
//! [`qbb_device::QbbNetDevice`]s.
//!
//! ## Overview
//!
//! Hosts and switches are joined by point-to-point links with a fixed line
//! rate and propagation delay. Every port of every node runs one device; the
//! network owns the clock, moves packets between devices and routes them
//! through switches along static shortest paths.
//!
//! - **Scheduler** (`scheduler.rs`): Cancellable event queue, FIFO within a timestamp
//! - **Topology** (`topology.rs`): Hosts, switches and links; star, line and dumbbell builders
//! - **Network** (`network.rs`): Devices, shared buffers, routing and the event loop
//! - **Apps** (`apps.rs`): Paced UDP senders and sequence-tracking sinks
//! - **Stats** (`stats.rs`): Trace counters and flow completion times
//! - **Scenarios** (`scenarios.rs`): PFC pause, incast and lossy-link runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use qbb_simulation::*;
//!
//! let config = ScenarioConfig::for_kind(ScenarioKind::Incast);
//! let report = run_scenario(ScenarioKind::Incast, &config)?;
//! assert!(report.completed);
//! println!("{}", format_report(&report));
//! ```
//!
//! ## Determinism
//!
//! Events at the same instant run in the order they were scheduled, and every
//! random draw comes from a seeded generator, so a scenario with the same
//! configuration produces the same report.

pub mod apps;
pub mod config;
pub mod error;
pub mod network;
pub mod scenarios;
pub mod scheduler;
pub mod stats;
pub mod topology;
pub mod types;

pub use apps::{FlowSpec, SinkFlow, UdpSender, UdpSink};
pub use config::{SimulationFile, default_config_toml};
pub use error::{SimResult, SimulationError};
pub use network::{Network, NetworkSettings};
pub use scenarios::{
    ScenarioConfig, ScenarioKind, ScenarioReport, build_scenario, format_report, run_scenario,
};
pub use scheduler::{EventId, Scheduler};
pub use stats::{FctSummary, FlowCompletion, TraceCounters};
pub use topology::{LinkSpec, Topology, TopologyBuilder};
pub use types::{AppId, PortLink, SimEvent};
