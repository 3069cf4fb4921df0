//! Shared-buffer admission model of a switch
//!
//! [`SharedBuffer`] tracks how many bytes every (ingress port, priority) and
//! every (egress port, priority) holds in one switch's packet memory, and
//! decides admission, PFC pause/resume and ECN marking from those counters.
//!
//! Ingress accounting is split into a guaranteed minimum per priority group,
//! a shared pool and a per-group headroom that absorbs what arrives after a
//! pause was sent. Egress accounting mirrors it with a per-queue minimum and
//! the shared pool.
//!
//! ## Pause thresholds
//!
//! - **Static**: pause when the group's bytes reach `pg_shared_limit`, or
//!   pause every class of the port when the port reaches `port_max_shared`.
//! - **Dynamic**: pause when headroom is in use, or when the group's shared
//!   usage reaches `alpha` times the pool space left.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use qbb_core::{AdmissionControl, ConfigError, PortIndex, PriorityMask, PRIORITY_COUNT};

use crate::queue::CONTROL_CLASS;

/// Buffer cell size in bytes
pub const CELL_SIZE: u64 = 1030;

/// Limits and ECN parameters of a [`SharedBuffer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Total packet memory
    pub max_buffer_bytes: u64,
    /// Shared pool size, beyond which arrivals draw on headroom
    pub shared_pool_bytes: u64,
    /// Guaranteed bytes per ingress priority group
    pub pg_min_bytes: u64,
    /// Guaranteed bytes per ingress port
    pub port_min_bytes: u64,
    /// Static pause threshold per priority group
    pub pg_shared_limit_bytes: u64,
    /// Static pause threshold per ingress port
    pub port_max_shared_bytes: u64,
    /// Headroom per priority group
    pub pg_headroom_bytes: u64,
    /// Hysteresis below the group threshold before resuming
    pub pg_resume_offset_bytes: u64,
    /// Hysteresis below the port threshold before resuming
    pub port_resume_offset_bytes: u64,

    /// Guaranteed bytes per egress queue
    pub queue_min_bytes: u64,
    /// Shared bytes an egress queue may hold
    pub queue_shared_limit_bytes: u64,
    /// Bytes an egress port may hold
    pub egress_port_limit_bytes: u64,
    /// Shared bytes all egress queues may hold together
    pub egress_pool_bytes: u64,

    /// Use the dynamic (alpha) pause threshold
    pub dynamic_threshold: bool,
    /// Fraction of free pool a group may take under the dynamic threshold
    pub pg_alpha: f64,

    /// Egress depth where marking starts
    pub kmin_bytes: u64,
    /// Egress depth where every packet is marked
    pub kmax_bytes: u64,
    /// Marking probability at `kmax_bytes`
    pub pmax: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 12_000 * CELL_SIZE,
            shared_pool_bytes: 4_000 * CELL_SIZE,
            pg_min_bytes: CELL_SIZE,
            port_min_bytes: CELL_SIZE,
            pg_shared_limit_bytes: 20 * CELL_SIZE,
            port_max_shared_bytes: 4_800 * CELL_SIZE,
            pg_headroom_bytes: 100 * CELL_SIZE,
            pg_resume_offset_bytes: 2 * CELL_SIZE,
            port_resume_offset_bytes: 4 * CELL_SIZE,
            queue_min_bytes: CELL_SIZE,
            queue_shared_limit_bytes: u64::MAX / 4,
            egress_port_limit_bytes: u64::MAX / 4,
            egress_pool_bytes: u64::MAX / 4,
            dynamic_threshold: false,
            pg_alpha: 1.0 / 8.0,
            kmin_bytes: 5_000,
            kmax_bytes: 200_000,
            pmax: 0.01,
        }
    }
}

impl BufferConfig {
    pub fn with_dynamic_threshold(mut self, enabled: bool) -> Self {
        self.dynamic_threshold = enabled;
        self
    }

    pub fn with_pg_shared_limit(mut self, bytes: u64) -> Self {
        self.pg_shared_limit_bytes = bytes;
        self
    }

    pub fn with_ecn(mut self, kmin_bytes: u64, kmax_bytes: u64, pmax: f64) -> Self {
        self.kmin_bytes = kmin_bytes;
        self.kmax_bytes = kmax_bytes;
        self.pmax = pmax;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kmin_bytes >= self.kmax_bytes {
            return Err(ConfigError::invalid("kmin_bytes", "must be below kmax_bytes"));
        }
        if !(0.0..=1.0).contains(&self.pmax) {
            return Err(ConfigError::invalid("pmax", "must be in [0, 1]"));
        }
        if self.pg_resume_offset_bytes > self.pg_shared_limit_bytes {
            return Err(ConfigError::invalid(
                "pg_resume_offset_bytes",
                "exceeds pg_shared_limit_bytes",
            ));
        }
        if self.port_resume_offset_bytes > self.port_max_shared_bytes {
            return Err(ConfigError::invalid(
                "port_resume_offset_bytes",
                "exceeds port_max_shared_bytes",
            ));
        }
        if self.shared_pool_bytes > self.max_buffer_bytes {
            return Err(ConfigError::invalid(
                "shared_pool_bytes",
                "exceeds max_buffer_bytes",
            ));
        }
        if self.dynamic_threshold && !(self.pg_alpha > 0.0) {
            return Err(ConfigError::invalid("pg_alpha", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PortCounters {
    bytes: u64,
    class_bytes: [u64; PRIORITY_COUNT],
    headroom: [u64; PRIORITY_COUNT],
}

#[derive(Debug, Clone, Copy, Default)]
struct EgressCounters {
    bytes: u64,
    min_bytes: [u64; PRIORITY_COUNT],
    shared_bytes: [u64; PRIORITY_COUNT],
}

/// Byte accounting of one switch's packet memory
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    config: BufferConfig,
    total_bytes: u64,
    ingress_shared: u64,
    egress_shared: u64,
    ingress: Vec<PortCounters>,
    egress: Vec<EgressCounters>,
    remote_paused: Vec<PriorityMask>,
    rng: StdRng,
}

impl SharedBuffer {
    /// Empty buffer for a switch with `ports` ports; `seed` drives ECN marking
    pub fn new(config: BufferConfig, ports: usize, seed: u64) -> Self {
        Self {
            config,
            total_bytes: 0,
            ingress_shared: 0,
            egress_shared: 0,
            ingress: vec![PortCounters::default(); ports],
            egress: vec![EgressCounters::default(); ports],
            remote_paused: vec![PriorityMask::EMPTY; ports],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn port_count(&self) -> usize {
        self.ingress.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn ingress_shared_bytes(&self) -> u64 {
        self.ingress_shared
    }

    pub fn ingress_bytes(&self, port: PortIndex, priority: usize) -> u64 {
        self.ingress_port(port).map_or(0, |p| p.class_bytes[priority])
    }

    pub fn headroom_bytes(&self, port: PortIndex, priority: usize) -> u64 {
        self.ingress_port(port).map_or(0, |p| p.headroom[priority])
    }

    pub fn egress_bytes(&self, port: PortIndex) -> u64 {
        self.egress_port(port).map_or(0, |p| p.bytes)
    }

    fn ingress_port(&self, port: PortIndex) -> Option<&PortCounters> {
        self.ingress.get(port.as_usize())
    }

    fn egress_port(&self, port: PortIndex) -> Option<&EgressCounters> {
        self.egress.get(port.as_usize())
    }

    fn ensure_port(&mut self, port: PortIndex) {
        let needed = port.as_usize() + 1;
        if self.ingress.len() < needed {
            self.ingress.resize(needed, PortCounters::default());
            self.egress.resize(needed, EgressCounters::default());
            self.remote_paused.resize(needed, PriorityMask::EMPTY);
        }
    }

    /// Room left in the shared pool
    fn pool_free(&self) -> f64 {
        self.config.shared_pool_bytes.saturating_sub(self.ingress_shared) as f64
    }

    /// Group bytes beyond its guaranteed minimum
    fn pg_over_min(&self, port: &PortCounters, priority: usize) -> u64 {
        port.class_bytes[priority].saturating_sub(self.config.pg_min_bytes)
    }
}

impl AdmissionControl for SharedBuffer {
    fn check_ingress(&self, port: PortIndex, priority: usize, size: u32) -> bool {
        let size = u64::from(size);
        if self.total_bytes + size > self.config.max_buffer_bytes {
            return false;
        }
        let Some(counters) = self.ingress_port(port) else {
            return true;
        };
        let beyond_min = counters.class_bytes[priority] + size > self.config.pg_min_bytes
            && counters.bytes + size > self.config.port_min_bytes;
        if beyond_min && self.ingress_shared > self.config.shared_pool_bytes {
            return counters.headroom[priority] + size <= self.config.pg_headroom_bytes;
        }
        true
    }

    fn check_egress(&self, port: PortIndex, priority: usize, size: u32) -> bool {
        let size = u64::from(size);
        let Some(counters) = self.egress_port(port) else {
            return true;
        };
        if counters.min_bytes[priority] + size < self.config.queue_min_bytes {
            return true;
        }
        counters.shared_bytes[priority] + size <= self.config.queue_shared_limit_bytes
            && counters.bytes + size <= self.config.egress_port_limit_bytes
            && self.egress_shared + size <= self.config.egress_pool_bytes
    }

    fn update_ingress(&mut self, port: PortIndex, priority: usize, size: u32) {
        self.ensure_port(port);
        let size = u64::from(size);
        self.total_bytes += size;
        self.ingress_shared += size;
        let over_pool = self.ingress_shared > self.config.shared_pool_bytes;
        let counters = &mut self.ingress[port.as_usize()];
        counters.bytes += size;
        counters.class_bytes[priority] += size;
        if over_pool {
            counters.headroom[priority] += size;
        }
    }

    fn update_egress(&mut self, port: PortIndex, priority: usize, size: u32) {
        self.ensure_port(port);
        let size = u64::from(size);
        let queue_min = self.config.queue_min_bytes;
        let counters = &mut self.egress[port.as_usize()];
        counters.bytes += size;
        if counters.min_bytes[priority] + size < queue_min {
            counters.min_bytes[priority] += size;
        } else {
            counters.shared_bytes[priority] += size;
            self.egress_shared += size;
        }
    }

    fn remove_from_ingress(&mut self, port: PortIndex, priority: usize, size: u32) {
        self.ensure_port(port);
        let size = u64::from(size);
        self.total_bytes = self.total_bytes.saturating_sub(size);
        self.ingress_shared = self.ingress_shared.saturating_sub(size);
        let counters = &mut self.ingress[port.as_usize()];
        counters.bytes = counters.bytes.saturating_sub(size);
        counters.class_bytes[priority] = counters.class_bytes[priority].saturating_sub(size);
        counters.headroom[priority] = counters.headroom[priority].saturating_sub(size);
    }

    fn remove_from_egress(&mut self, port: PortIndex, priority: usize, size: u32) {
        self.ensure_port(port);
        let size = u64::from(size);
        let counters = &mut self.egress[port.as_usize()];
        counters.bytes = counters.bytes.saturating_sub(size);
        let from_shared = size.min(counters.shared_bytes[priority]);
        counters.shared_bytes[priority] -= from_shared;
        self.egress_shared = self.egress_shared.saturating_sub(from_shared);
        counters.min_bytes[priority] = counters.min_bytes[priority].saturating_sub(size - from_shared);
    }

    fn pause_classes(&self, port: PortIndex, priority: usize) -> PriorityMask {
        let Some(counters) = self.ingress_port(port) else {
            return PriorityMask::EMPTY;
        };
        if self.config.dynamic_threshold {
            let threshold = self.config.pg_alpha * self.pool_free();
            let congested = counters.headroom[priority] > 0
                || self.pg_over_min(counters, priority) as f64 >= threshold;
            return if congested {
                PriorityMask::single(priority)
            } else {
                PriorityMask::EMPTY
            };
        }
        if counters.bytes >= self.config.port_max_shared_bytes {
            return (0..PRIORITY_COUNT)
                .filter(|&p| p != CONTROL_CLASS)
                .collect();
        }
        if counters.class_bytes[priority] >= self.config.pg_shared_limit_bytes {
            return PriorityMask::single(priority);
        }
        PriorityMask::EMPTY
    }

    fn should_resume(&self, port: PortIndex, priority: usize) -> bool {
        let Some(counters) = self.ingress_port(port) else {
            return true;
        };
        if counters.headroom[priority] > 0 {
            return false;
        }
        if self.config.dynamic_threshold {
            if counters.class_bytes[priority] <= self.config.pg_min_bytes {
                return true;
            }
            let threshold = self.config.pg_alpha * self.pool_free()
                - self.config.pg_resume_offset_bytes as f64;
            return (self.pg_over_min(counters, priority) as f64) < threshold;
        }
        let port_limit = self
            .config
            .port_max_shared_bytes
            .saturating_sub(self.config.port_resume_offset_bytes);
        if counters.bytes > port_limit {
            return false;
        }
        let pg_limit = self
            .config
            .pg_shared_limit_bytes
            .saturating_sub(self.config.pg_resume_offset_bytes);
        counters.class_bytes[priority] < pg_limit
    }

    fn should_send_cn(&mut self, _ingress: PortIndex, egress: PortIndex, priority: usize) -> bool {
        if priority == CONTROL_CLASS {
            return false;
        }
        let shared = self.egress_shared_bytes(egress, priority);
        let (kmin, kmax) = (self.config.kmin_bytes, self.config.kmax_bytes);
        if shared > kmax {
            return true;
        }
        if shared > kmin {
            let p = self.config.pmax * (shared - kmin) as f64 / (kmax - kmin) as f64;
            return self.rng.random::<f64>() < p;
        }
        false
    }

    fn set_remote_paused(&mut self, port: PortIndex, priority: usize, paused: bool) {
        self.ensure_port(port);
        let mask = &mut self.remote_paused[port.as_usize()];
        if paused {
            mask.insert(priority);
        } else {
            mask.remove(priority);
        }
    }

    fn is_remote_paused(&self, port: PortIndex, priority: usize) -> bool {
        self.remote_paused
            .get(port.as_usize())
            .is_some_and(|mask| mask.contains(priority))
    }

    fn egress_shared_bytes(&self, port: PortIndex, priority: usize) -> u64 {
        self.egress_port(port).map_or(0, |p| p.shared_bytes[priority])
    }
}
