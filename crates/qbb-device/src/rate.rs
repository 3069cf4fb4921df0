//! Per-flow QCN/DCQCN reaction point
//!
//! Every flow keeps one [`HopState`] per tracked bottleneck. A hop idles at
//! line rate until its first congestion notification, which cuts its smoothed
//! rate and enters fast recovery. From then on two independent triggers push
//! it back up:
//!
//! - the **byte counter** expires after `byte_counter` bytes are sent
//! - the **rate timer** fires every `rp_timer`
//!
//! Each trigger bumps its own stage counter. Below `fast_recovery_times` the
//! hop only averages toward its target; once one counter passes the threshold
//! it adds `rate_ai` (active), once both do it adds a growing multiple of
//! `rate_hai` (hyperactive). A new notification always restarts fast
//! recovery. Alpha tracks the marked fraction and decays on its own timer.
//!
//! The flow sends at the minimum smoothed rate over its hops.

use std::time::Duration;

use qbb_core::{DataRate, DeviceContext, DeviceTimer, FlowIndex};

use crate::config::QbbConfig;
use crate::timers::TimerSlot;

/// Rate-control stage of one hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RpStage {
    /// No congestion seen yet
    #[default]
    Idle,
    FastRecovery,
    Active,
    Hyperactive,
}

/// When a notification pulls the target rate down to the current rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampPolicy {
    /// Only when the byte counter had already advanced
    AfterByteIncrease,
    /// After any byte or time increase
    AfterAnyIncrease,
    /// On every notification
    Always,
}

/// Reaction-point parameters shared by all flows of a device
#[derive(Debug, Clone, PartialEq)]
pub struct RateParams {
    pub line_rate: DataRate,
    pub min_rate: DataRate,
    pub gain: f64,
    pub initial_alpha: f64,
    pub byte_counter: i64,
    pub fast_recovery_times: u32,
    pub rate_ai: DataRate,
    pub rate_hai: DataRate,
    pub rp_timer: Duration,
    pub alpha_resume_interval: Duration,
    pub clamp: ClampPolicy,
}

impl RateParams {
    pub fn from_config(config: &QbbConfig) -> Self {
        let clamp = if config.clamp_target_rate {
            ClampPolicy::Always
        } else if config.clamp_target_rate_after_time_inc {
            ClampPolicy::AfterAnyIncrease
        } else {
            ClampPolicy::AfterByteIncrease
        };
        Self {
            line_rate: config.data_rate,
            min_rate: config.min_rate,
            gain: config.gain,
            initial_alpha: config.initial_alpha,
            byte_counter: i64::try_from(config.byte_counter).unwrap_or(i64::MAX),
            fast_recovery_times: config.fast_recovery_times,
            rate_ai: config.rate_ai,
            rate_hai: config.rate_hai,
            rp_timer: config.rp_timer(),
            alpha_resume_interval: config.alpha_resume_interval(),
            clamp,
        }
    }
}

/// Reaction-point state of one (flow, hop)
#[derive(Debug, Clone)]
pub struct HopState {
    pub target_rate: DataRate,
    /// Smoothed current rate
    pub rate_all: DataRate,
    /// Estimate of the marked fraction
    pub alpha: f64,
    pub byte_stage: u32,
    pub time_stage: u32,
    /// Bytes left before the next byte-counter event
    pub tx_bytes: i64,
    pub stage: RpStage,
    /// Period of the next rate timer
    pub rp_while: Duration,
    rate_timer: TimerSlot,
    alpha_timer: TimerSlot,
}

impl HopState {
    fn new(params: &RateParams) -> Self {
        Self {
            target_rate: params.line_rate,
            rate_all: params.line_rate,
            alpha: params.initial_alpha,
            byte_stage: 0,
            time_stage: 0,
            tx_bytes: params.byte_counter,
            stage: RpStage::Idle,
            rp_while: params.rp_timer,
            rate_timer: TimerSlot::empty(),
            alpha_timer: TimerSlot::empty(),
        }
    }
}

/// Sending rate of one flow and the reaction points that set it
#[derive(Debug, Clone)]
pub struct FlowRate {
    rate: DataRate,
    hops: Vec<HopState>,
}

impl FlowRate {
    pub fn new(params: &RateParams, hops: usize) -> Self {
        Self {
            rate: params.line_rate,
            hops: (0..hops.max(1)).map(|_| HopState::new(params)).collect(),
        }
    }

    /// Current sending rate: the minimum smoothed rate over all hops
    pub fn rate(&self) -> DataRate {
        self.rate
    }

    pub fn hop(&self, hop: usize) -> Option<&HopState> {
        self.hops.get(hop)
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// React to congestion feedback carrying marked fraction `fraction`
    ///
    /// A fraction above one flags the hop as quasi-congested: the hop restarts
    /// fast recovery but neither alpha nor the rate is cut.
    pub fn cnm_received(
        &mut self,
        ctx: &mut impl DeviceContext,
        params: &RateParams,
        flow: FlowIndex,
        hop: usize,
        fraction: f64,
    ) {
        let Some(state) = self.hops.get_mut(hop) else {
            return;
        };
        let clamp = match params.clamp {
            ClampPolicy::AfterByteIncrease => state.byte_stage != 0,
            ClampPolicy::AfterAnyIncrease => state.byte_stage != 0 || state.time_stage != 0,
            ClampPolicy::Always => true,
        };
        if clamp {
            state.target_rate = state.rate_all;
            state.tx_bytes = params.byte_counter;
        }
        state.byte_stage = 0;
        state.time_stage = 0;
        if fraction <= 1.0 {
            state.alpha = (1.0 - params.gain) * state.alpha + params.gain;
            state.rate_all = (state.rate_all * (1.0 - state.alpha / 2.0)).max(params.min_rate);
        }
        let tag = hop_id(hop);
        state.alpha_timer.replace(
            ctx,
            params.alpha_resume_interval,
            DeviceTimer::AlphaResume { flow, hop: tag },
        );
        state.rp_while = params.rp_timer;
        state.rate_timer.replace(
            ctx,
            state.rp_while,
            DeviceTimer::RateIncrease { flow, hop: tag },
        );
        state.stage = RpStage::FastRecovery;
        self.refresh_rate(params);
    }

    /// Time-based increase; reschedules itself
    pub fn on_rate_timer(
        &mut self,
        ctx: &mut impl DeviceContext,
        params: &RateParams,
        flow: FlowIndex,
        hop: usize,
    ) {
        let Some(state) = self.hops.get_mut(hop) else {
            return;
        };
        let stage = state.stage;
        if stage == RpStage::Idle {
            return;
        }
        state.time_stage += 1;
        let time_stage = state.time_stage;
        state.rp_while = match stage {
            RpStage::Hyperactive => params.rp_timer / 2,
            _ => params.rp_timer,
        };
        state.rate_timer.replace(
            ctx,
            state.rp_while,
            DeviceTimer::RateIncrease {
                flow,
                hop: hop_id(hop),
            },
        );
        match stage {
            RpStage::FastRecovery => self.fast_step(params, hop, time_stage),
            RpStage::Active => self.active_select(params, hop),
            RpStage::Hyperactive => self.hyper_increase(params, hop),
            RpStage::Idle => {}
        }
    }

    /// Alpha decay; reschedules itself
    pub fn on_alpha_timer(
        &mut self,
        ctx: &mut impl DeviceContext,
        params: &RateParams,
        flow: FlowIndex,
        hop: usize,
    ) {
        let Some(state) = self.hops.get_mut(hop) else {
            return;
        };
        state.alpha *= 1.0 - params.gain;
        state.alpha_timer.replace(
            ctx,
            params.alpha_resume_interval,
            DeviceTimer::AlphaResume {
                flow,
                hop: hop_id(hop),
            },
        );
    }

    /// Charge `size` sent bytes against every hop's byte counter
    pub fn on_bytes_sent(&mut self, params: &RateParams, size: u32) {
        for hop in 0..self.hops.len() {
            let state = &mut self.hops[hop];
            if state.stage == RpStage::Idle {
                state.tx_bytes = params.byte_counter;
                continue;
            }
            state.tx_bytes -= i64::from(size);
            if state.tx_bytes >= 0 {
                continue;
            }
            state.byte_stage += 1;
            let stage = state.stage;
            match stage {
                RpStage::FastRecovery => {
                    state.tx_bytes = params.byte_counter;
                    let byte_stage = state.byte_stage;
                    self.fast_step(params, hop, byte_stage);
                }
                RpStage::Active => {
                    state.tx_bytes = params.byte_counter;
                    self.active_increase(params, hop);
                }
                RpStage::Hyperactive => {
                    state.tx_bytes = params.byte_counter / 2;
                    self.hyper_increase(params, hop);
                }
                RpStage::Idle => {}
            }
        }
    }

    /// Cancel every timer of every hop
    pub fn cancel_timers(&mut self, ctx: &mut impl DeviceContext) {
        for state in &mut self.hops {
            state.rate_timer.cancel(ctx);
            state.alpha_timer.cancel(ctx);
        }
    }

    /// Fast-recovery step after a counter advanced to `count`
    fn fast_step(&mut self, params: &RateParams, hop: usize, count: u32) {
        if count < params.fast_recovery_times {
            self.adjust_rates(params, hop, DataRate::ZERO);
            self.hops[hop].stage = RpStage::FastRecovery;
        } else {
            self.active_select(params, hop);
        }
    }

    fn active_select(&mut self, params: &RateParams, hop: usize) {
        let state = &self.hops[hop];
        let threshold = params.fast_recovery_times;
        if state.byte_stage < threshold || state.time_stage < threshold {
            self.active_increase(params, hop);
        } else {
            self.hyper_increase(params, hop);
        }
    }

    fn active_increase(&mut self, params: &RateParams, hop: usize) {
        self.adjust_rates(params, hop, params.rate_ai);
        self.hops[hop].stage = RpStage::Active;
    }

    fn hyper_increase(&mut self, params: &RateParams, hop: usize) {
        let state = &self.hops[hop];
        let steps = state
            .byte_stage
            .min(state.time_stage)
            .saturating_sub(params.fast_recovery_times)
            + 1;
        self.adjust_rates(params, hop, params.rate_hai * u64::from(steps));
        self.hops[hop].stage = RpStage::Hyperactive;
    }

    fn adjust_rates(&mut self, params: &RateParams, hop: usize, increase: DataRate) {
        let state = &mut self.hops[hop];
        let first_increase = state.byte_stage == 1 || state.time_stage == 1;
        if first_increase && state.target_rate > state.rate_all * 10u64 {
            state.target_rate = state.target_rate / 8;
        } else {
            state.target_rate = state.target_rate + increase;
        }
        state.rate_all = (state.rate_all / 2 + state.target_rate / 2)
            .clamp(params.min_rate, params.line_rate);
        self.refresh_rate(params);
    }

    fn refresh_rate(&mut self, params: &RateParams) {
        self.rate = self
            .hops
            .iter()
            .map(|h| h.rate_all)
            .fold(params.line_rate, DataRate::min);
    }
}

fn hop_id(hop: usize) -> u8 {
    u8::try_from(hop).unwrap_or(u8::MAX)
}
