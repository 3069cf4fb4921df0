//! Virtual time and link speed types
//!
//! All device logic runs on a discrete-event clock. [`SimTime`] is an absolute
//! instant in nanoseconds since the start of the run; relative delays use
//! [`std::time::Duration`]. [`DataRate`] is a link or flow speed in bits per
//! second and knows how long a given number of bytes takes to serialize.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An absolute instant on the simulation clock, in nanoseconds
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Start of the run
    pub const ZERO: SimTime = SimTime(0);
    /// Never reached; used as the "blocked" send time of a flow
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_micros_f64(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: SimTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        let nanos = u64::try_from(rhs.as_nanos()).unwrap_or(u64::MAX);
        SimTime(self.0.saturating_add(nanos))
    }
}

impl AddAssign<Duration> for SimTime {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Debug for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimTime({})", self)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == SimTime::MAX {
            return write!(f, "+inf");
        }
        write!(f, "{:.3}us", self.as_micros_f64())
    }
}

/// A link or sending rate in bits per second
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    pub const ZERO: DataRate = DataRate(0);

    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    pub const fn from_gbps(gbps: u64) -> Self {
        Self(gbps * 1_000_000_000)
    }

    pub const fn bps(&self) -> u64 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    /// Serialization time of `bytes` at this rate
    pub fn tx_time(&self, bytes: u32) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        let nanos = u128::from(bytes) * 8 * 1_000_000_000 / u128::from(self.0);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Serialization time of a fractional byte count, used for credit pacing
    pub fn tx_time_f64(&self, bytes: f64) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        if !bytes.is_finite() || bytes <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes * 8.0 / self.0 as f64)
    }

    /// Ratio of this rate to `other`
    pub fn ratio(&self, other: DataRate) -> f64 {
        if other.0 == 0 {
            return 0.0;
        }
        self.0 as f64 / other.0 as f64
    }

    pub fn saturating_sub(self, rhs: DataRate) -> DataRate {
        DataRate(self.0.saturating_sub(rhs.0))
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(self.0.saturating_add(rhs.0))
    }
}

impl Sub for DataRate {
    type Output = DataRate;

    fn sub(self, rhs: DataRate) -> DataRate {
        self.saturating_sub(rhs)
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: f64) -> DataRate {
        let scaled = self.0 as f64 * rhs;
        if !scaled.is_finite() || scaled <= 0.0 {
            return DataRate::ZERO;
        }
        DataRate(scaled.round() as u64)
    }
}

impl Mul<u64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: u64) -> DataRate {
        DataRate(self.0.saturating_mul(rhs))
    }
}

impl Div<u64> for DataRate {
    type Output = DataRate;

    fn div(self, rhs: u64) -> DataRate {
        DataRate(self.0.checked_div(rhs).unwrap_or(0))
    }
}

const RATE_UNITS: [(&str, u64); 4] = [
    ("Gb/s", 1_000_000_000),
    ("Mb/s", 1_000_000),
    ("Kb/s", 1_000),
    ("b/s", 1),
];

impl fmt::Debug for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataRate({})", self)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (unit, scale) in RATE_UNITS {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, unit);
            }
        }
        write!(f, "{}b/s", self.0)
    }
}

impl FromStr for DataRate {
    type Err = ConfigError;

    /// Parses `"40Gb/s"`, `"100Mbps"`, `"1.5Gbps"` or a bare bit count
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| ConfigError::InvalidRate(s.to_string()))?;

        let scale = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b/s" | "bps" => 1.0,
            "kb/s" | "kbps" => 1e3,
            "mb/s" | "mbps" => 1e6,
            "gb/s" | "gbps" => 1e9,
            _ => return Err(ConfigError::InvalidRate(s.to_string())),
        };

        Ok(DataRate((value * scale).round() as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(rate: DataRate) -> String {
        rate.to_string()
    }
}

/// Convert fractional microseconds (the unit used by configuration files) to a duration
pub fn micros_f64(us: f64) -> Duration {
    if !us.is_finite() || us <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(us / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_arithmetic() {
        let t = SimTime::from_micros(5);
        assert_eq!(t.as_nanos(), 5_000);
        assert_eq!(t + Duration::from_nanos(250), SimTime::from_nanos(5_250));
        assert_eq!(SimTime::from_micros(7) - t, Duration::from_micros(2));
        assert_eq!(t - SimTime::from_micros(7), Duration::ZERO);
        assert_eq!(SimTime::MAX + Duration::from_secs(1), SimTime::MAX);
    }

    #[test]
    fn test_tx_time() {
        let rate = DataRate::from_gbps(40);
        assert_eq!(rate.tx_time(1000), Duration::from_nanos(200));
        assert_eq!(DataRate::from_gbps(1).tx_time(1500), Duration::from_micros(12));
        assert_eq!(DataRate::ZERO.tx_time(1), Duration::MAX);
        assert_eq!(rate.tx_time_f64(-3.0), Duration::ZERO);
    }

    #[test]
    fn test_rate_parse_and_display() {
        assert_eq!("40Gb/s".parse::<DataRate>().unwrap(), DataRate::from_gbps(40));
        assert_eq!("100Mbps".parse::<DataRate>().unwrap(), DataRate::from_mbps(100));
        assert_eq!("1.5Gbps".parse::<DataRate>().unwrap(), DataRate::from_mbps(1500));
        assert_eq!("12345".parse::<DataRate>().unwrap(), DataRate::from_bps(12345));
        assert!("fast".parse::<DataRate>().is_err());
        assert!("10 furlongs".parse::<DataRate>().is_err());

        assert_eq!(DataRate::from_gbps(40).to_string(), "40Gb/s");
        assert_eq!(DataRate::from_mbps(1500).to_string(), "1500Mb/s");
        assert_eq!(DataRate::from_bps(7).to_string(), "7b/s");
    }

    #[test]
    fn test_rate_arithmetic() {
        let r = DataRate::from_gbps(10);
        assert_eq!(r / 8, DataRate::from_mbps(1250));
        assert_eq!(r * 0.5, DataRate::from_gbps(5));
        assert_eq!(r * -1.0, DataRate::ZERO);
        assert_eq!(DataRate::from_mbps(5) - r, DataRate::ZERO);
        assert_eq!(r + DataRate::from_mbps(5), DataRate::from_mbps(10_005));
        assert!((DataRate::from_gbps(1).ratio(r) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_rate_serde_as_string() {
        let json = serde_json::to_string(&DataRate::from_gbps(25)).unwrap();
        assert_eq!(json, "\"25Gb/s\"");
        let back: DataRate = serde_json::from_str("\"100Mb/s\"").unwrap();
        assert_eq!(back, DataRate::from_mbps(100));
    }
}
