//! Logical timers multiplexed onto a [`Scheduler`]'s base clock.
//!
//! A slice never ticks on its own. Its phase accumulator (`phase`, in base
//! ticks) is advanced only by the scheduler's tick pass or set by `reset`.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::scheduler::{Scheduler, SchedulerInner};
use crate::signal::{Signal, Signals, SubscriptionId, TimerEvent};
use crate::tickable::{validate_count, validate_interval, AuxData, Count, Tickable};

#[derive(Debug)]
pub(crate) struct SliceState {
    pub(crate) tag: Option<String>,
    pub(crate) interval: Duration,
    pub(crate) count: Count,
    /// Base clock interval `times` was computed against.
    pub(crate) base_interval: Duration,
    /// `interval / base_interval`: base ticks per logical fire.
    pub(crate) times: f64,
    /// Accumulated base ticks, in `[0, times)` between passes.
    pub(crate) phase: f64,
    pub(crate) fired_count: u64,
    pub(crate) delta_fired: u64,
    pub(crate) aux: AuxData,
    pub(crate) radical_mode: bool,
}

impl SliceState {
    pub(crate) fn new(tag: Option<String>, base_interval: Duration, radical_mode: bool) -> Self {
        let interval = Duration::from_secs(1);
        Self {
            tag,
            interval,
            count: Count::Unbounded,
            base_interval,
            times: ratio(interval, base_interval),
            phase: 0.0,
            fired_count: 0,
            delta_fired: 1,
            aux: AuxData::default(),
            radical_mode,
        }
    }
}

pub(crate) struct SliceInner {
    pub(crate) id: u64,
    pub(crate) state: RefCell<SliceState>,
    pub(crate) signals: Signals,
    pub(crate) scheduler: RefCell<Weak<SchedulerInner>>,
}

/// Handle to one logical timer. Clones refer to the same slice.
#[derive(Clone)]
pub struct TimerSlice {
    pub(crate) inner: Rc<SliceInner>,
}

impl PartialEq for TimerSlice {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TimerSlice {}

impl std::fmt::Debug for TimerSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("TimerSlice")
            .field("id", &self.inner.id)
            .field("tag", &state.tag)
            .field("interval", &state.interval)
            .field("count", &state.count)
            .field("times", &state.times)
            .field("phase", &state.phase)
            .field("fired_count", &state.fired_count)
            .finish()
    }
}

impl TimerSlice {
    pub(crate) fn bound(id: u64, state: SliceState, scheduler: Weak<SchedulerInner>) -> Self {
        Self {
            inner: Rc::new(SliceInner {
                id,
                state: RefCell::new(state),
                signals: Signals::new(),
                scheduler: RefCell::new(scheduler),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Reuse key this slice is registered under.
    pub fn tag(&self) -> Option<String> {
        self.inner.state.borrow().tag.clone()
    }

    pub fn times(&self) -> f64 {
        self.inner.state.borrow().times
    }

    pub fn phase(&self) -> f64 {
        self.inner.state.borrow().phase
    }

    pub fn radical_mode(&self) -> bool {
        self.inner.state.borrow().radical_mode
    }

    pub fn set_radical_mode(&self, radical_mode: bool) {
        self.inner.state.borrow_mut().radical_mode = radical_mode;
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.inner
            .scheduler
            .borrow()
            .upgrade()
            .map(|inner| Scheduler { inner })
    }

    pub fn is_bound(&self) -> bool {
        self.scheduler().is_some()
    }

    /// Present in the scheduler's active set.
    pub fn is_active(&self) -> bool {
        self.scheduler().is_some_and(|s| s.is_active(self))
    }

    /// Reconfigures the slice, clearing progress, and activates it once the
    /// current call stack has unwound.
    ///
    /// `handoff` carries the overflow of a previous timing context; it is
    /// converted to phase so the slice resumes where that context left off.
    pub fn reset(&self, interval: Duration, count: Count, handoff: Option<&AuxData>) -> Result<&Self> {
        {
            let mut state = self.inner.state.borrow_mut();
            let times = slice_times(interval, state.base_interval)?;
            state.count = validate_count("count", count)?;
            state.interval = interval;
            state.times = times;
            state.delta_fired = 1;

            match handoff.and_then(AuxData::overflow) {
                Some(overflow) => {
                    let phase = ratio(overflow, state.base_interval);
                    state.phase = phase % times;
                    state.fired_count = state.count.clamp((phase / times).floor() as u64);
                }
                None => {
                    state.phase = 0.0;
                    state.fired_count = 0;
                }
            }
            tracing::debug!(
                id = self.inner.id,
                tag = ?state.tag,
                ?interval,
                times,
                phase = state.phase,
                "slice reset"
            );
        }

        match self.scheduler() {
            Some(scheduler) => {
                let weak = Rc::downgrade(&self.inner);
                scheduler.event_loop().defer(move || {
                    if let Some(inner) = weak.upgrade() {
                        TimerSlice { inner }.start();
                    }
                });
            }
            None => tracing::warn!(id = self.inner.id, "reset on a slice with no scheduler, it will not start"),
        }
        Ok(self)
    }

    /// Changes tempo without touching phase. A lowered bound clamps the
    /// fired count.
    pub fn set(&self, interval: Duration, count: Count) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        let times = slice_times(interval, state.base_interval)?;
        state.count = validate_count("count", count)?;
        state.interval = interval;
        state.times = times;
        state.fired_count = state.count.clamp(state.fired_count);
        Ok(())
    }

    pub fn start(&self) {
        match self.scheduler() {
            Some(scheduler) => scheduler.activate(self),
            None => tracing::warn!(id = self.inner.id, "slice was never added to a scheduler, start ignored"),
        }
    }

    pub fn stop(&self) {
        match self.scheduler() {
            Some(scheduler) => scheduler.deactivate(self),
            None => tracing::warn!(id = self.inner.id, "slice is already detached, stop ignored"),
        }
    }

    /// Subscribes to Action. In radical mode, a running slice immediately
    /// invokes the new observer once with its current state.
    pub fn on_action<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&TimerEvent) + 'static,
    {
        let id = self.inner.signals.connect(Signal::Action, f);
        if self.radical_mode() && self.is_running() {
            self.inner.signals.emit_to(id, &self.current_event(Signal::Action));
        }
        id
    }

    pub fn on_done<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&TimerEvent) + 'static,
    {
        self.inner.signals.connect(Signal::Done, f)
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.inner.signals.disconnect(id)
    }

    /// Emits a manual Action with `delta_fired = 0`; counters are unchanged.
    pub fn trigger(&self) {
        let mut event = self.current_event(Signal::Action);
        event.delta_fired = 0;
        self.inner.signals.emit(&event);
    }

    pub(crate) fn current_event(&self, signal: Signal) -> TimerEvent {
        let state = self.inner.state.borrow();
        TimerEvent::new(signal, state.delta_fired, state.fired_count, state.aux)
            .with_tag(state.tag.clone())
    }

    pub(crate) fn emit(&self, event: &TimerEvent) {
        self.inner.signals.emit(event);
    }

    /// Detaches from the scheduler and drops every observer.
    pub(crate) fn dispose(&self) {
        *self.inner.scheduler.borrow_mut() = Weak::new();
        self.inner.signals.clear();
    }

    /// Moves the slice onto a new base resolution. Phase is rescaled so the
    /// elapsed time within the current period is kept.
    pub(crate) fn rebase(&self, base_interval: Duration) {
        let mut state = self.inner.state.borrow_mut();
        let phase = state.phase * ratio(state.base_interval, base_interval);
        state.base_interval = base_interval;
        state.times = ratio(state.interval, base_interval);
        state.phase = phase % state.times;
    }

    /// Bounded slice whose count was reached before it ever ran, e.g. by a
    /// large handoff.
    pub(crate) fn is_exhausted(&self) -> bool {
        let state = self.inner.state.borrow();
        state.count.is_reached(state.fired_count)
    }
}

impl Tickable for TimerSlice {
    fn interval(&self) -> Duration {
        self.inner.state.borrow().interval
    }

    fn count(&self) -> Count {
        self.inner.state.borrow().count
    }

    fn fired_count(&self) -> u64 {
        self.inner.state.borrow().fired_count
    }

    fn delta_fired(&self) -> u64 {
        self.inner.state.borrow().delta_fired
    }

    fn aux_data(&self) -> AuxData {
        self.inner.state.borrow().aux
    }

    /// Active, and the scheduler's base clock is running.
    fn is_running(&self) -> bool {
        self.scheduler()
            .is_some_and(|s| s.is_running() && s.is_active(self))
    }
}

fn ratio(interval: Duration, base: Duration) -> f64 {
    interval.as_nanos() as f64 / base.as_nanos() as f64
}

/// Base periods per slice period.
pub fn slice_times(interval: Duration, base: Duration) -> Result<f64, ConfigError> {
    validate_interval("interval", interval)?;
    validate_interval("base_interval", base)?;
    let times = ratio(interval, base);
    if !times.is_finite() || times <= 0.0 {
        return Err(ConfigError::invalid(
            "interval",
            format!("{interval:?} over a {base:?} base gives a degenerate ratio {times}"),
        ));
    }
    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_is_the_interval_ratio() {
        let base = Duration::from_millis(100);
        assert_eq!(slice_times(Duration::from_millis(500), base).unwrap(), 5.0);
        assert_eq!(slice_times(Duration::from_millis(300), base).unwrap(), 3.0);
        assert_eq!(slice_times(Duration::from_millis(250), base).unwrap(), 2.5);
        assert!(slice_times(Duration::ZERO, base).is_err());
        assert!(slice_times(Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[test]
    fn unbound_slice_ignores_lifecycle_calls() {
        let slice = TimerSlice::bound(
            7,
            SliceState::new(None, Duration::from_millis(100), false),
            Weak::new(),
        );
        slice.start();
        slice.stop();
        assert!(!slice.is_bound());
        assert!(!slice.is_active());
        assert!(!slice.is_running());
        assert_eq!(slice.times(), 10.0);
    }

    #[test]
    fn reset_converts_handoff_overflow_to_phase() {
        let slice = TimerSlice::bound(
            0,
            SliceState::new(None, Duration::from_millis(100), false),
            Weak::new(),
        );
        let handoff = AuxData::with_overflow(Duration::from_millis(750));
        slice
            .reset(Duration::from_millis(500), Count::Unbounded, Some(&handoff))
            .unwrap();
        assert_eq!(slice.times(), 5.0);
        assert_eq!(slice.phase(), 2.5);
        assert_eq!(slice.fired_count(), 1);

        slice.reset(Duration::from_millis(500), Count::Unbounded, None).unwrap();
        assert_eq!(slice.phase(), 0.0);
        assert_eq!(slice.fired_count(), 0);
    }

    #[test]
    fn handoff_never_pushes_fired_count_past_the_bound() {
        let slice = TimerSlice::bound(
            0,
            SliceState::new(Some("h".into()), Duration::from_millis(100), false),
            Weak::new(),
        );
        let handoff = AuxData::with_overflow(Duration::from_secs(9));
        slice
            .reset(Duration::from_secs(1), Count::Times(3), Some(&handoff))
            .unwrap();
        assert_eq!(slice.fired_count(), 3);
        assert!(slice.is_exhausted());

        slice
            .reset(Duration::from_secs(1), Count::Unbounded, Some(&handoff))
            .unwrap();
        assert_eq!(slice.fired_count(), 9);
        assert!(!slice.is_exhausted());
    }

    #[test]
    fn lowering_the_bound_clamps_fired_count() {
        let mut state = SliceState::new(None, Duration::from_millis(100), false);
        state.fired_count = 5;
        let slice = TimerSlice::bound(0, state, Weak::new());
        slice.set(Duration::from_millis(500), Count::Times(2)).unwrap();
        assert_eq!(slice.fired_count(), 2);
    }

    #[test]
    fn set_keeps_progress() {
        let slice = TimerSlice::bound(
            0,
            SliceState::new(None, Duration::from_millis(100), false),
            Weak::new(),
        );
        {
            let mut state = slice.inner.state.borrow_mut();
            state.phase = 3.0;
            state.fired_count = 4;
        }
        slice.set(Duration::from_secs(2), Count::Times(10)).unwrap();
        assert_eq!(slice.times(), 20.0);
        assert_eq!(slice.phase(), 3.0);
        assert_eq!(slice.fired_count(), 4);
        assert_eq!(slice.count(), Count::Times(10));
        assert!(slice.set(Duration::ZERO, Count::Unbounded).is_err());
        assert_eq!(slice.interval(), Duration::from_secs(2));
    }
}
