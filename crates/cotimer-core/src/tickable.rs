//! The capability shared by everything that fires periodically.
//!
//! Drivers, the [`Timer`](crate::Timer) facade and scheduler slices all
//! report the same counters through [`Tickable`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How many logical periods a timer fires before it is done.
///
/// Serialized as a signed integer: any negative value (canonically `-1`)
/// means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Count {
    #[default]
    Unbounded,
    Times(u64),
}

impl Count {
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 {
            Count::Unbounded
        } else {
            Count::Times(raw as u64)
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            Count::Unbounded => -1,
            Count::Times(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_bounded(self) -> bool {
        matches!(self, Count::Times(_))
    }

    /// True once `fired` has reached the bound. Never true when unbounded.
    pub fn is_reached(self, fired: u64) -> bool {
        match self {
            Count::Unbounded => false,
            Count::Times(n) => fired >= n,
        }
    }

    pub fn clamp(self, fired: u64) -> u64 {
        match self {
            Count::Unbounded => fired,
            Count::Times(n) => fired.min(n),
        }
    }
}

impl From<i64> for Count {
    fn from(raw: i64) -> Self {
        Count::from_raw(raw)
    }
}

impl From<Count> for i64 {
    fn from(count: Count) -> Self {
        count.as_raw()
    }
}

/// Extra data a driver attaches to an event to explain drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxData {
    /// Elapsed real time not yet consumed by a whole interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow_secs: Option<f64>,
}

impl AuxData {
    pub fn with_overflow(overflow: Duration) -> Self {
        Self {
            overflow_secs: Some(overflow.as_secs_f64()),
        }
    }

    pub fn overflow(&self) -> Option<Duration> {
        self.overflow_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Read-only view of a periodic timer's progress.
pub trait Tickable {
    fn interval(&self) -> Duration;

    fn count(&self) -> Count;

    /// Periods fired since the last start. Clamped at `count` when bounded.
    fn fired_count(&self) -> u64;

    /// Periods represented by the most recent event.
    fn delta_fired(&self) -> u64;

    fn aux_data(&self) -> AuxData;

    fn is_running(&self) -> bool;

    /// Logical time consumed so far, `fired_count * interval`.
    fn elapsed(&self) -> Duration {
        let fired = u32::try_from(self.fired_count()).unwrap_or(u32::MAX);
        self.interval().saturating_mul(fired)
    }
}

pub(crate) fn validate_interval(key: &str, interval: Duration) -> Result<Duration, ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::invalid(key, "interval must be positive"));
    }
    Ok(interval)
}

pub(crate) fn validate_count(key: &str, count: Count) -> Result<Count, ConfigError> {
    if count == Count::Times(0) {
        return Err(ConfigError::invalid(
            key,
            "count must be positive, or -1 for unbounded",
        ));
    }
    Ok(count)
}

/// Converts a seconds value from configuration into a positive interval.
pub fn interval_from_secs(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    let interval = Duration::try_from_secs_f64(secs)
        .map_err(|e| ConfigError::invalid(key, format!("{secs} is not a valid interval: {e}")))?;
    validate_interval(key, interval)
}
