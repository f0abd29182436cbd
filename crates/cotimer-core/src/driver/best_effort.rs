//! Best-effort foreground driver.
//!
//! Assumes the platform calls back about once per interval and adds the
//! current `delta_fired` on every callback without looking at the clock.

use std::time::Duration;

use tokio::time::Instant;

use super::{settle, DriverTick, PhysicalDriver};
use crate::error::ConfigError;
use crate::tickable::{validate_count, validate_interval, AuxData, Count, Tickable};

#[derive(Debug, Clone)]
pub struct BestEffortDriver {
    interval: Duration,
    count: Count,
    fired_count: u64,
    delta_fired: u64,
    last_invocation: Option<Instant>,
    running: bool,
}

impl BestEffortDriver {
    pub fn new(interval: Duration, count: Count) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: validate_interval("interval", interval)?,
            count: validate_count("count", count)?,
            fired_count: 0,
            delta_fired: 1,
            last_invocation: None,
            running: false,
        })
    }

    pub fn last_invocation(&self) -> Option<Instant> {
        self.last_invocation
    }
}

impl Tickable for BestEffortDriver {
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
        AuxData::default()
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl PhysicalDriver for BestEffortDriver {
    fn start(&mut self, _now: Instant) {
        self.fired_count = 0;
        self.last_invocation = None;
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn tick(&mut self, now: Instant) -> Option<DriverTick> {
        if !self.running {
            return None;
        }
        self.last_invocation = Some(now);
        self.fired_count = self.fired_count.saturating_add(self.delta_fired);

        let finished = settle(self.count, &mut self.fired_count);
        if finished {
            self.running = false;
        }

        Some(DriverTick {
            delta_fired: self.delta_fired,
            fired_count: self.fired_count,
            aux: AuxData::default(),
            finished,
        })
    }

    fn set_delta_fired(&mut self, delta: u64) {
        self.delta_fired = delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_callback_counts_one_period() {
        let t0 = Instant::now();
        let mut driver = BestEffortDriver::new(Duration::from_secs(1), Count::Unbounded).unwrap();
        driver.start(t0);

        // Elapsed time is ignored entirely.
        let tick = driver.tick(t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(tick.delta_fired, 1);
        assert_eq!(tick.fired_count, 1);
        assert_eq!(tick.aux, AuxData::default());
    }

    #[test]
    fn custom_delta_is_added_per_callback() {
        let t0 = Instant::now();
        let mut driver = BestEffortDriver::new(Duration::from_secs(1), Count::Times(5)).unwrap();
        driver.set_delta_fired(2);
        driver.start(t0);

        assert!(!driver.tick(t0).unwrap().finished);
        assert!(!driver.tick(t0).unwrap().finished);
        let last = driver.tick(t0).unwrap();
        assert!(last.finished);
        assert_eq!(last.fired_count, 5);
        assert!(!driver.is_running());
        assert!(driver.tick(t0).is_none());
    }
}
