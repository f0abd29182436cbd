//! Drift-corrected driver.
//!
//! Every callback measures real elapsed time against the last consumed
//! timestamp and reports however many whole intervals fit, so a delayed or
//! suspended process catches up in one event instead of drifting.

use std::time::Duration;

use tokio::time::Instant;

use super::{settle, DriverTick, PhysicalDriver};
use crate::error::ConfigError;
use crate::tickable::{validate_count, validate_interval, AuxData, Count, Tickable};

#[derive(Debug, Clone)]
pub struct DriftCorrectedDriver {
    interval: Duration,
    count: Count,
    fired_count: u64,
    delta_fired: u64,
    aux: AuxData,
    /// Start of the time not yet consumed by a whole interval.
    last_timestamp: Option<Instant>,
    running: bool,
}

impl DriftCorrectedDriver {
    pub fn new(interval: Duration, count: Count) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: validate_interval("interval", interval)?,
            count: validate_count("count", count)?,
            fired_count: 0,
            delta_fired: 1,
            aux: AuxData::default(),
            last_timestamp: None,
            running: false,
        })
    }

    pub fn last_timestamp(&self) -> Option<Instant> {
        self.last_timestamp
    }
}

impl Tickable for DriftCorrectedDriver {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn count(&self) -> Count {
        self.count
    }

    fn fired_count(&self) -> u64 {
        self.fired_count
    }

    fn delta_fired(&self) -> u64 {
        self.delta_fired
    }

    fn aux_data(&self) -> AuxData {
        self.aux
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl PhysicalDriver for DriftCorrectedDriver {
    fn start(&mut self, now: Instant) {
        self.fired_count = 0;
        self.delta_fired = 1;
        self.aux = AuxData::default();
        self.last_timestamp = Some(now);
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn tick(&mut self, now: Instant) -> Option<DriverTick> {
        if !self.running {
            return None;
        }
        let last = self.last_timestamp?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.interval {
            return None;
        }

        let interval_ns = self.interval.as_nanos();
        let elapsed_ns = elapsed.as_nanos();
        let delta = u64::try_from(elapsed_ns / interval_ns).unwrap_or(u64::MAX);
        // Strictly less than the interval, so it fits.
        let overflow = Duration::from_nanos((elapsed_ns % interval_ns) as u64);

        self.delta_fired = delta;
        self.fired_count = self.fired_count.saturating_add(delta);
        self.aux = AuxData::with_overflow(overflow);
        self.last_timestamp = Some(now - overflow);

        let finished = settle(self.count, &mut self.fired_count);
        if finished {
            self.running = false;
        }
        tracing::trace!(delta, fired = self.fired_count, ?overflow, finished, "drift-corrected tick");

        Some(DriverTick {
            delta_fired: delta,
            fired_count: self.fired_count,
            aux: self.aux,
            finished,
        })
    }

    fn set_delta_fired(&mut self, delta: u64) {
        self.delta_fired = delta;
    }
}
