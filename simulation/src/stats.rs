//! Run statistics
//!
//! - [`TraceCounters`]: how often each device trace event fired
//! - [`FlowCompletion`]: start, finish and ideal completion time of one flow
//! - [`FctSummary`]: flow completion time and slowdown percentiles

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use qbb_core::{DropReason, NodeId, SimTime, TraceEvent};

use crate::types::AppId;

/// Per-event counts of every trace a device emitted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCounters {
    pub events: BTreeMap<String, u64>,
    /// Packets refused by switch admission
    pub admission_drops: u64,
    /// Packets the receive-side error model discarded
    pub corrupted: u64,
    pub pauses_sent: u64,
    pub resumes_sent: u64,
}

impl TraceCounters {
    pub fn record(&mut self, event: &TraceEvent) {
        *self.events.entry(event.name().to_string()).or_default() += 1;
        match event {
            TraceEvent::MacTxDrop {
                reason: DropReason::Admission,
                ..
            } => self.admission_drops += 1,
            TraceEvent::PhyRxDrop { .. } => self.corrupted += 1,
            TraceEvent::PauseSent { resume: false, .. } => self.pauses_sent += 1,
            TraceEvent::PauseSent { resume: true, .. } => self.resumes_sent += 1,
            _ => {}
        }
    }

    /// Count of events with the given trace name
    pub fn count(&self, name: &str) -> u64 {
        self.events.get(name).copied().unwrap_or(0)
    }
}

/// Completion record of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCompletion {
    pub app: AppId,
    pub source: NodeId,
    pub destination: NodeId,
    pub packets: u32,
    pub bytes: u64,
    pub start: SimTime,
    pub finish: Option<SimTime>,
    /// Completion time on an idle fabric
    pub ideal: Duration,
}

impl FlowCompletion {
    pub fn fct(&self) -> Option<Duration> {
        self.finish.map(|finish| finish.saturating_since(self.start))
    }

    /// Completion time relative to the idle-fabric completion time
    pub fn slowdown(&self) -> Option<f64> {
        let fct = self.fct()?;
        if self.ideal.is_zero() {
            return None;
        }
        Some((fct.as_nanos() as f64 / self.ideal.as_nanos() as f64).max(1.0))
    }
}

/// Summary over every flow of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FctSummary {
    pub flows: usize,
    pub completed: usize,
    pub mean_fct_us: f64,
    pub p50_fct_us: f64,
    pub p99_fct_us: f64,
    pub max_fct_us: f64,
    pub mean_slowdown: f64,
    pub p99_slowdown: f64,
}

impl FctSummary {
    pub fn from_flows(flows: &[FlowCompletion]) -> Self {
        let mut fcts: Vec<f64> = flows
            .iter()
            .filter_map(FlowCompletion::fct)
            .map(|fct| fct.as_nanos() as f64 / 1_000.0)
            .collect();
        let mut slowdowns: Vec<f64> = flows.iter().filter_map(FlowCompletion::slowdown).collect();
        fcts.sort_by(f64::total_cmp);
        slowdowns.sort_by(f64::total_cmp);

        Self {
            flows: flows.len(),
            completed: fcts.len(),
            mean_fct_us: mean(&fcts),
            p50_fct_us: percentile(&fcts, 0.50),
            p99_fct_us: percentile(&fcts, 0.99),
            max_fct_us: fcts.last().copied().unwrap_or(0.0),
            mean_slowdown: mean(&slowdowns),
            p99_slowdown: percentile(&slowdowns, 0.99),
        }
    }

    pub fn all_completed(&self) -> bool {
        self.completed == self.flows
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile of sorted `values`
fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbb_core::{Address, FlowKey, PortIndex};

    fn flow(app: usize, fct_us: Option<u64>, ideal_us: u64) -> FlowCompletion {
        FlowCompletion {
            app: AppId(app),
            source: NodeId(0),
            destination: NodeId(1),
            packets: 10,
            bytes: 10_300,
            start: SimTime::from_micros(10),
            finish: fct_us.map(|us| SimTime::from_micros(10 + us)),
            ideal: Duration::from_micros(ideal_us),
        }
    }

    #[test]
    fn test_counters_classify_events() {
        let mut counters = TraceCounters::default();
        counters.record(&TraceEvent::MacTxDrop {
            uid: 1,
            size: 100,
            reason: DropReason::Admission,
        });
        counters.record(&TraceEvent::PauseSent {
            port: PortIndex(0),
            priority: 3,
            resume: false,
        });
        counters.record(&TraceEvent::PauseSent {
            port: PortIndex(0),
            priority: 3,
            resume: true,
        });
        counters.record(&TraceEvent::Retransmit {
            flow: FlowKey::new(Address::UNSPECIFIED, 4000, 3),
            packets: 4,
        });

        assert_eq!(counters.admission_drops, 1);
        assert_eq!(counters.pauses_sent, 1);
        assert_eq!(counters.resumes_sent, 1);
        assert_eq!(counters.count("pause_sent"), 2);
        assert_eq!(counters.count("retransmit"), 1);
        assert_eq!(counters.count("phy_rx_drop"), 0);
    }

    #[test]
    fn test_slowdown_never_below_one() {
        assert_eq!(flow(0, Some(20), 10).slowdown(), Some(2.0));
        assert_eq!(flow(0, Some(5), 10).slowdown(), Some(1.0));
        assert_eq!(flow(0, None, 10).slowdown(), None);
        assert_eq!(flow(0, Some(5), 0).slowdown(), None);
    }

    #[test]
    fn test_summary_percentiles() {
        let flows: Vec<FlowCompletion> = (1..=100)
            .map(|i| flow(i as usize, Some(i), 1))
            .chain(std::iter::once(flow(0, None, 1)))
            .collect();
        let summary = FctSummary::from_flows(&flows);
        assert_eq!(summary.flows, 101);
        assert_eq!(summary.completed, 100);
        assert!(!summary.all_completed());
        assert_eq!(summary.p50_fct_us, 50.0);
        assert_eq!(summary.p99_fct_us, 99.0);
        assert_eq!(summary.max_fct_us, 100.0);
        assert!((summary.mean_fct_us - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        let summary = FctSummary::from_flows(&[]);
        assert_eq!(summary, FctSummary::default());
        assert!(summary.all_completed());
    }
}
