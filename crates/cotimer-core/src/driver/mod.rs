//! Physical drivers: the only things that turn platform callbacks into
//! counted periods.
//!
//! A driver does not own its platform callback. Whoever owns the driver
//! (normally a [`Timer`](crate::Timer)) registers a ticker on the
//! [`EventLoop`](crate::EventLoop) and feeds each callback into
//! [`PhysicalDriver::tick`], the same way a wall-clock state machine is fed
//! by a caller that polls it.

mod best_effort;
mod drift;

pub use best_effort::BestEffortDriver;
pub use drift::DriftCorrectedDriver;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::tickable::{AuxData, Count, Tickable};

/// Outcome of a platform callback that fired at least one period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverTick {
    pub delta_fired: u64,
    pub fired_count: u64,
    pub aux: AuxData,
    /// The bounded count was reached; the driver has stopped itself.
    pub finished: bool,
}

pub trait PhysicalDriver: Tickable {
    /// Resets counters and begins measuring from `now`.
    fn start(&mut self, now: Instant);

    fn stop(&mut self);

    /// Processes one platform callback. `None` means nothing fired.
    fn tick(&mut self, now: Instant) -> Option<DriverTick>;

    fn set_delta_fired(&mut self, delta: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Measures real elapsed time; survives delayed callbacks.
    DriftCorrected,
    /// Trusts the callback cadence.
    BestEffort,
}

impl DriverKind {
    pub fn for_background(background_mode: bool) -> Self {
        if background_mode {
            DriverKind::DriftCorrected
        } else {
            DriverKind::BestEffort
        }
    }

    pub fn build(
        self,
        interval: Duration,
        count: Count,
    ) -> Result<Box<dyn PhysicalDriver>, ConfigError> {
        Ok(match self {
            DriverKind::DriftCorrected => Box::new(DriftCorrectedDriver::new(interval, count)?),
            DriverKind::BestEffort => Box::new(BestEffortDriver::new(interval, count)?),
        })
    }
}

/// Shared completion rule: clamp to the bound and report whether it was hit.
pub(crate) fn settle(count: Count, fired_count: &mut u64) -> bool {
    if count.is_reached(*fired_count) {
        *fired_count = count.clamp(*fired_count);
        true
    } else {
        false
    }
}
