//! Device configuration
//!
//! [`QbbConfig`] holds every tunable of a QBB device. Times are stored in
//! microseconds so configuration files stay readable; the accessor methods
//! convert them to [`Duration`]s. Defaults are the classic DCQCN settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use qbb_core::{micros_f64, ConfigError, DataRate};

/// ECN marking variant used by switches and the matching receiver feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcnVariant {
    /// RED-style marking with CE on congested egress queues
    Standard,
    /// Marks only packets that were not held back by a pause
    NoPause,
    /// Marks a resumed queue's packets as suspect (ECT(0)) right after a
    /// resume, and only escalates to CE if the queue keeps growing
    RootCause,
}

/// Configuration for a [`crate::QbbNetDevice`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QbbConfig {
    /// Line rate of the link
    pub data_rate: DataRate,
    /// Idle time inserted after every packet
    pub interframe_gap_ns: u64,

    /// Honor and generate PFC frames
    pub qbb_enabled: bool,
    /// Duration advertised in generated PAUSE frames
    pub pause_time_us: u32,

    /// Run QCN rate control on NICs
    pub qcn_enabled: bool,
    /// How often a receiver reports congestion per flow
    pub cnp_interval_us: f64,
    /// Alpha decay period
    pub alpha_resume_interval_us: f64,
    /// Rate-increase timer period
    pub rp_timer_us: f64,
    /// Byte or timer events spent in fast recovery before increasing
    pub fast_recovery_times: u32,
    /// Alpha gain `g`
    pub gain: f64,
    pub initial_alpha: f64,
    pub min_rate: DataRate,
    /// Bytes sent between byte-counter events
    pub byte_counter: u64,
    /// Additive increase step
    pub rate_ai: DataRate,
    /// Hyper-active increase step
    pub rate_hai: DataRate,
    /// Always pull the target rate down to the current rate on congestion
    pub clamp_target_rate: bool,
    /// Pull the target rate down only after a byte or time increase
    pub clamp_target_rate_after_time_inc: bool,
    /// Marks arriving before this much time has elapsed are not counted
    pub np_sampling_interval_us: f64,
    /// Independent rate-control bottlenecks tracked per flow
    pub hops: usize,

    /// Minimum gap between NACKs for the same missing sequence
    pub nack_interval_us: f64,
    /// Go-back-N granularity in packets; 0 disables chunking
    pub chunk_size: u32,
    /// Packets between ACKs; 0 disables ACKs
    pub ack_interval: u32,
    /// Rewind to the start of the chunk on loss
    pub back_to_zero: bool,
    /// Receiver keeps its position on loss even in back-to-zero mode
    pub test_read: bool,
    /// Stop a flow after each chunk until it is acknowledged
    pub wait_for_ack: bool,
    /// Retransmit timeout while waiting for an ACK
    pub wait_ack_timer_us: f64,
    /// Retained unacknowledged packets per flow
    pub send_buffer_capacity: usize,

    pub np_ecn: bool,
    pub root_ecn: bool,
    /// Window after a resume during which packets are marked ECT(0)
    pub root_ecn_interval_us: f64,
    /// React to ECT(0) feedback without cutting the rate
    pub root_ecn_cc: bool,
    /// Queue growth tolerated between root-ECN checks
    pub root_ecn_growth_bytes: u64,
    /// Queue depth below which root-ECN returns to idle
    pub root_ecn_drain_bytes: u64,

    /// Emit rate and queue samples at this period; 0 disables sampling
    pub sample_interval_us: f64,
}

impl Default for QbbConfig {
    fn default() -> Self {
        Self {
            data_rate: DataRate::from_gbps(40),
            interframe_gap_ns: 0,
            qbb_enabled: true,
            pause_time_us: 5,
            qcn_enabled: false,
            cnp_interval_us: 50.0,
            alpha_resume_interval_us: 55.0,
            rp_timer_us: 1500.0,
            fast_recovery_times: 5,
            gain: 1.0 / 16.0,
            initial_alpha: 0.5,
            min_rate: DataRate::from_mbps(100),
            byte_counter: 150_000,
            rate_ai: DataRate::from_mbps(5),
            rate_hai: DataRate::from_mbps(50),
            clamp_target_rate: false,
            clamp_target_rate_after_time_inc: false,
            np_sampling_interval_us: 0.0,
            hops: 1,
            nack_interval_us: 500.0,
            chunk_size: 0,
            ack_interval: 0,
            back_to_zero: false,
            test_read: false,
            wait_for_ack: false,
            wait_ack_timer_us: 500.0,
            send_buffer_capacity: 8000,
            np_ecn: false,
            root_ecn: false,
            root_ecn_interval_us: 40.0,
            root_ecn_cc: false,
            root_ecn_growth_bytes: 900,
            root_ecn_drain_bytes: 2 * 1030,
            sample_interval_us: 0.0,
        }
    }
}

impl QbbConfig {
    /// DCQCN end host: QCN on, PFC on
    pub fn dcqcn() -> Self {
        Self {
            qcn_enabled: true,
            ..Default::default()
        }
    }

    /// Reliable chunked delivery on top of DCQCN
    pub fn reliable(chunk_size: u32, ack_interval: u32) -> Self {
        Self {
            qcn_enabled: true,
            chunk_size,
            ack_interval,
            wait_for_ack: true,
            ..Default::default()
        }
    }

    pub fn with_data_rate(mut self, rate: DataRate) -> Self {
        self.data_rate = rate;
        self
    }

    pub fn with_qcn(mut self, enabled: bool) -> Self {
        self.qcn_enabled = enabled;
        self
    }

    pub fn with_pfc(mut self, enabled: bool) -> Self {
        self.qbb_enabled = enabled;
        self
    }

    pub fn with_pause_time_us(mut self, us: u32) -> Self {
        self.pause_time_us = us;
        self
    }

    pub fn with_ack_interval(mut self, packets: u32) -> Self {
        self.ack_interval = packets;
        self
    }

    pub fn with_chunk_size(mut self, packets: u32) -> Self {
        self.chunk_size = packets;
        self
    }

    pub fn with_back_to_zero(mut self, enabled: bool) -> Self {
        self.back_to_zero = enabled;
        self
    }

    pub fn with_wait_for_ack(mut self, enabled: bool) -> Self {
        self.wait_for_ack = enabled;
        self
    }

    pub fn with_ecn_variant(mut self, variant: EcnVariant) -> Self {
        self.np_ecn = variant == EcnVariant::NoPause;
        self.root_ecn = variant == EcnVariant::RootCause;
        self
    }

    pub fn with_hops(mut self, hops: usize) -> Self {
        self.hops = hops;
        self
    }

    pub fn with_sample_interval_us(mut self, us: f64) -> Self {
        self.sample_interval_us = us;
        self
    }

    pub fn ecn_variant(&self) -> EcnVariant {
        match (self.np_ecn, self.root_ecn) {
            (true, _) => EcnVariant::NoPause,
            (false, true) => EcnVariant::RootCause,
            (false, false) => EcnVariant::Standard,
        }
    }

    pub fn interframe_gap(&self) -> Duration {
        Duration::from_nanos(self.interframe_gap_ns)
    }

    pub fn pause_time(&self) -> Duration {
        Duration::from_micros(u64::from(self.pause_time_us))
    }

    pub fn cnp_interval(&self) -> Duration {
        micros_f64(self.cnp_interval_us)
    }

    pub fn alpha_resume_interval(&self) -> Duration {
        micros_f64(self.alpha_resume_interval_us)
    }

    pub fn rp_timer(&self) -> Duration {
        micros_f64(self.rp_timer_us)
    }

    pub fn nack_interval(&self) -> Duration {
        micros_f64(self.nack_interval_us)
    }

    pub fn wait_ack_timer(&self) -> Duration {
        micros_f64(self.wait_ack_timer_us)
    }

    pub fn np_sampling_interval(&self) -> Duration {
        micros_f64(self.np_sampling_interval_us)
    }

    pub fn root_ecn_interval(&self) -> Duration {
        micros_f64(self.root_ecn_interval_us)
    }

    /// `None` when sampling is disabled
    pub fn sample_interval(&self) -> Option<Duration> {
        (self.sample_interval_us > 0.0).then(|| micros_f64(self.sample_interval_us))
    }

    /// Reject combinations the device cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_rate.bps() == 0 {
            return Err(ConfigError::invalid("data_rate", "must be positive"));
        }
        if self.min_rate > self.data_rate {
            return Err(ConfigError::invalid(
                "min_rate",
                format!("{} exceeds line rate {}", self.min_rate, self.data_rate),
            ));
        }
        if !(self.gain > 0.0 && self.gain <= 1.0) {
            return Err(ConfigError::invalid("gain", "must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.initial_alpha) {
            return Err(ConfigError::invalid("initial_alpha", "must be in [0, 1]"));
        }
        if self.hops == 0 || self.hops > usize::from(u8::MAX) {
            return Err(ConfigError::invalid("hops", "must be between 1 and 255"));
        }
        if self.fast_recovery_times == 0 {
            return Err(ConfigError::invalid("fast_recovery_times", "must be positive"));
        }
        if self.send_buffer_capacity == 0 {
            return Err(ConfigError::invalid("send_buffer_capacity", "must be positive"));
        }
        if self.qbb_enabled && self.pause_time_us == 0 {
            return Err(ConfigError::invalid("pause_time_us", "must be positive when PFC is on"));
        }
        if self.np_ecn && self.root_ecn {
            return Err(ConfigError::invalid(
                "np_ecn",
                "cannot be combined with root_ecn",
            ));
        }
        if self.root_ecn_cc && !self.root_ecn {
            return Err(ConfigError::MissingPrerequisite {
                option: "root_ecn_cc",
                requires: "root_ecn",
            });
        }
        if self.back_to_zero && self.chunk_size == 0 {
            return Err(ConfigError::MissingPrerequisite {
                option: "back_to_zero",
                requires: "chunk_size > 0",
            });
        }
        if self.wait_for_ack {
            if !self.qcn_enabled {
                return Err(ConfigError::MissingPrerequisite {
                    option: "wait_for_ack",
                    requires: "qcn_enabled",
                });
            }
            if self.chunk_size == 0 || self.ack_interval == 0 {
                return Err(ConfigError::MissingPrerequisite {
                    option: "wait_for_ack",
                    requires: "chunk_size > 0 and ack_interval > 0",
                });
            }
        }
        Ok(())
    }
}
