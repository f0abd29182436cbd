//! # cotimer Core Library
//!
//! Timers for a single cooperative execution context: physical drivers that
//! count elapsed periods, a facade that picks a driver, and a scheduler that
//! multiplexes many independently configured logical timers onto one base
//! clock.
//!
//! ## Architecture
//!
//! - **Event loop**: the only place platform callbacks and deferred tasks
//!   run. Driven manually with [`EventLoop::turn`] or on tokio with
//!   [`EventLoop::run_until`]
//! - **Drivers**: [`DriftCorrectedDriver`] measures real elapsed time and
//!   catches up after stalls; [`BestEffortDriver`] trusts the callback cadence
//! - **Facade**: [`Timer`] owns one driver per run and re-emits its events
//! - **Scheduler**: [`Scheduler`] fires [`TimerSlice`]s off one base [`Timer`]
//!
//! ## Key Components
//!
//! - [`Tickable`]: counters shared by every timer
//! - [`TimerEvent`]: payload of the `Action` and `Done` signals
//! - [`Scenario`]: TOML description of a scheduler and its slices

pub mod config;
pub mod driver;
pub mod error;
pub mod facade;
pub mod runtime;
pub mod scheduler;
pub mod signal;
pub mod slice;
pub mod tickable;

pub use config::{Scenario, SchedulerConfig, SliceConfig};
pub use driver::{BestEffortDriver, DriftCorrectedDriver, DriverKind, DriverTick, PhysicalDriver};
pub use error::{ConfigError, CoreError};
pub use facade::Timer;
pub use runtime::{Clock, EventLoop, ManualClock, SystemClock, TickerId};
pub use scheduler::Scheduler;
pub use signal::{Signal, Signals, SubscriptionId, TimerEvent};
pub use slice::{slice_times, TimerSlice};
pub use tickable::{interval_from_secs, AuxData, Count, Tickable};
