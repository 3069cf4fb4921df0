//! Pre-defined fabric scenarios
//!
//! Every scenario is a star: `senders` hosts send one flow each to a single
//! receiving host through one switch.
//!
//! - **pfc-pause**: line-rate senders overrun a small ingress threshold; the
//!   switch pauses them and nothing is dropped
//! - **incast**: DCQCN senders share the receiver's link; ECN marks turn into
//!   congestion notifications and rate cuts
//! - **lossy**: the receiver's NIC corrupts chosen sequence numbers; NACKs
//!   and go-back-N recover every packet

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use qbb_core::{DataRate, NodeId, PortIndex, SequenceErrorModel, SimTime};
use qbb_device::{BufferConfig, QbbConfig, CELL_SIZE};

use crate::apps::FlowSpec;
use crate::error::SimResult;
use crate::network::{Network, NetworkSettings};
use crate::stats::{FctSummary, FlowCompletion};
use crate::topology::TopologyBuilder;

/// The built-in scenarios
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    PfcPause,
    Incast,
    Lossy,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 3] = [
        ScenarioKind::PfcPause,
        ScenarioKind::Incast,
        ScenarioKind::Lossy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::PfcPause => "pfc-pause",
            ScenarioKind::Incast => "incast",
            ScenarioKind::Lossy => "lossy",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioKind::PfcPause => "Two line-rate senders, small PFC threshold, no drops",
            ScenarioKind::Incast => "Many DCQCN senders into one receiver link",
            ScenarioKind::Lossy => "Corrupted packets recovered by NACK and go-back-N",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters of a scenario run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Hosts sending to the single receiver
    pub senders: usize,
    pub link_rate: DataRate,
    /// One-way propagation delay of every link
    pub link_delay_ns: u64,
    pub packets_per_flow: u32,
    /// UDP payload bytes per packet
    pub payload_size: u32,
    pub priority: u8,
    /// Flow starts are spread uniformly over this window
    pub start_jitter_ns: u64,
    /// Give up if flows have not completed by then
    pub stop_time_us: u64,
    pub seed: u64,
    /// Sequence numbers the receiver's NIC corrupts once each
    pub lost_sequences: Vec<u32>,
    pub nic: QbbConfig,
    pub switch: QbbConfig,
    pub buffer: BufferConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            senders: 2,
            link_rate: DataRate::from_gbps(40),
            link_delay_ns: 1_000,
            packets_per_flow: 200,
            payload_size: 1000,
            priority: 3,
            start_jitter_ns: 0,
            stop_time_us: 10_000,
            seed: 1,
            lost_sequences: Vec::new(),
            nic: QbbConfig::default(),
            switch: QbbConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl ScenarioConfig {
    /// Defaults tuned for `kind`
    pub fn for_kind(kind: ScenarioKind) -> Self {
        let base = Self::default();
        match kind {
            ScenarioKind::PfcPause => Self {
                buffer: BufferConfig::default().with_pg_shared_limit(8 * CELL_SIZE),
                ..base
            },
            ScenarioKind::Incast => Self {
                senders: 4,
                packets_per_flow: 400,
                start_jitter_ns: 500,
                nic: QbbConfig::dcqcn(),
                switch: QbbConfig::dcqcn(),
                buffer: BufferConfig::default()
                    .with_pg_shared_limit(200 * CELL_SIZE)
                    .with_ecn(5_000, 50_000, 0.2),
                ..base
            },
            ScenarioKind::Lossy => Self {
                senders: 1,
                packets_per_flow: 100,
                lost_sequences: vec![5, 37, 38],
                nic: QbbConfig::reliable(16, 16),
                switch: QbbConfig::reliable(16, 16),
                ..base
            },
        }
    }

    pub fn stop_time(&self) -> SimTime {
        SimTime::from_micros(self.stop_time_us)
    }
}

/// Outcome of a scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: ScenarioKind,
    pub finished_at: SimTime,
    pub completed: bool,
    pub summary: FctSummary,
    pub flows: Vec<FlowCompletion>,
    pub events: BTreeMap<String, u64>,
    pub pauses_sent: u64,
    pub resumes_sent: u64,
    pub admission_drops: u64,
    pub corrupted: u64,
    /// Data packets receivers got more than once
    pub duplicates: u64,
}

impl ScenarioReport {
    pub fn count(&self, event: &str) -> u64 {
        self.events.get(event).copied().unwrap_or(0)
    }
}

/// Build the network for `kind` without running it
///
/// Hosts are nodes `0..senders`, the receiver is node `senders`, and the
/// switch is the last node.
pub fn build_scenario(kind: ScenarioKind, config: &ScenarioConfig) -> SimResult<Network> {
    let builder = TopologyBuilder::new(
        config.link_rate,
        Duration::from_nanos(config.link_delay_ns),
    );
    let topology = builder.star(config.senders + 1);
    let settings = NetworkSettings {
        nic: config.nic.clone(),
        switch: config.switch.clone(),
        buffer: config.buffer.clone(),
        seed: config.seed,
    };
    let mut network = Network::build(&topology, &settings)?;
    let receiver = NodeId(config.senders as u32);

    if kind == ScenarioKind::Lossy && !config.lost_sequences.is_empty() {
        let model = SequenceErrorModel::new(config.lost_sequences.iter().copied());
        network.set_error_model(receiver, PortIndex(0), Box::new(model))?;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    for sender in 0..config.senders {
        let jitter = if config.start_jitter_ns > 0 {
            rng.random_range(0..config.start_jitter_ns)
        } else {
            0
        };
        let spec = FlowSpec::new(NodeId(sender as u32), receiver, config.packets_per_flow)
            .with_ports(4000 + sender as u16, 5000)
            .with_priority(config.priority)
            .with_payload_size(config.payload_size)
            .starting_at(SimTime::from_nanos(jitter));
        network.add_flow(spec)?;
    }
    network.start()?;
    Ok(network)
}

/// Run `kind` to completion or its stop time
pub fn run_scenario(kind: ScenarioKind, config: &ScenarioConfig) -> SimResult<ScenarioReport> {
    info!(scenario = %kind, senders = config.senders, "=== Running scenario ===");
    let mut network = build_scenario(kind, config)?;
    let completed = network.run_until_complete(config.stop_time())?;
    network.log_status();

    let counters = network.counters();
    let report = ScenarioReport {
        scenario: kind,
        finished_at: network.now(),
        completed,
        summary: network.summary(),
        flows: network.flows().to_vec(),
        events: counters.events.clone(),
        pauses_sent: counters.pauses_sent,
        resumes_sent: counters.resumes_sent,
        admission_drops: counters.admission_drops,
        corrupted: counters.corrupted,
        duplicates: network.duplicates(),
    };
    info!(
        scenario = %kind,
        completed,
        mean_fct_us = report.summary.mean_fct_us,
        pauses = report.pauses_sent,
        drops = report.admission_drops,
        "Scenario finished"
    );
    Ok(report)
}

/// Human-readable report
pub fn format_report(report: &ScenarioReport) -> String {
    let mut output = String::new();
    output.push_str(&format!("Scenario: {}\n", report.scenario));
    output.push_str(&format!(
        "  Finished at: {:.1} us ({})\n",
        report.finished_at.as_micros_f64(),
        if report.completed { "all flows complete" } else { "stopped" }
    ));
    output.push_str(&format!(
        "  Flows: {}/{} complete\n",
        report.summary.completed, report.summary.flows
    ));
    output.push_str(&format!(
        "  FCT (us): mean {:.2}, p50 {:.2}, p99 {:.2}, max {:.2}\n",
        report.summary.mean_fct_us,
        report.summary.p50_fct_us,
        report.summary.p99_fct_us,
        report.summary.max_fct_us
    ));
    output.push_str(&format!(
        "  Slowdown: mean {:.2}, p99 {:.2}\n",
        report.summary.mean_slowdown, report.summary.p99_slowdown
    ));
    output.push_str(&format!(
        "  PFC: {} pauses, {} resumes\n",
        report.pauses_sent, report.resumes_sent
    ));
    output.push_str(&format!(
        "  Drops: {} admission, {} corrupted\n",
        report.admission_drops, report.corrupted
    ));
    output.push_str(&format!(
        "  CNs: {}, retransmits: {}\n",
        report.count("congestion_notified"),
        report.count("retransmit")
    ));
    output
}
