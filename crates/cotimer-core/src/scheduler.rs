//! Coalescing scheduler.
//!
//! One base [`Timer`] drives every registered [`TimerSlice`]. Each base
//! Action carries `delta_fired`, the number of base periods it represents
//! (more than one when the drift-corrected driver caught up after a stall).
//! The tick pass adds that to every active slice's phase and fires the
//! slices whose phase crossed their `times` threshold, in registration
//! order.
//!
//! ## Coalescing rule
//!
//! ```text
//! phase += base_delta
//! if phase < times: skip
//! phase  = phase mod times
//! delta  = base_delta > times ? floor(base_delta / times) : 1
//! ```
//!
//! At `base_delta == times` both branches give 1. The rule looks at
//! `base_delta` alone, so a slice with leftover phase that receives a large
//! catch-up tick can be credited one period fewer than its phase implies
//! (phase 4 of 5 plus a delta of 7 fires once, leaving phase 1).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::facade::Timer;
use crate::runtime::EventLoop;
use crate::signal::{Signal, TimerEvent};
use crate::slice::{slice_times, SliceState, TimerSlice};
use crate::tickable::{validate_count, validate_interval, AuxData, Count, Tickable};

#[derive(Default)]
struct SchedulerState {
    /// Fire order within a pass.
    active: Vec<TimerSlice>,
    /// Every slice bound to this scheduler.
    members: Vec<TimerSlice>,
    by_tag: HashMap<String, TimerSlice>,
    radical_mode: bool,
}

pub(crate) struct SchedulerInner {
    base: Timer,
    event_loop: EventLoop,
    state: RefCell<SchedulerState>,
    next_slice_id: Cell<u64>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.base.stop();
        let state = self.state.get_mut();
        state.active.clear();
        state.by_tag.clear();
        for slice in state.members.drain(..) {
            slice.dispose();
        }
    }
}

/// Handle to a coalescing scheduler. Clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Rc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Scheduler")
            .field("base", &self.inner.base)
            .field("slices", &state.members.len())
            .field("active", &state.active.len())
            .finish()
    }
}

/// Outcome of advancing one slice by a base tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fire {
    Action,
    Done,
}

impl Scheduler {
    pub fn new(event_loop: &EventLoop, config: &SchedulerConfig) -> Result<Self> {
        let base = Timer::new(event_loop, config.base_interval()?, Count::Unbounded)?;
        base.set_background_mode(config.background_mode);

        let inner = Rc::new(SchedulerInner {
            base,
            event_loop: event_loop.clone(),
            state: RefCell::new(SchedulerState {
                radical_mode: config.radical_mode,
                ..SchedulerState::default()
            }),
            next_slice_id: Cell::new(0),
        });

        let weak = Rc::downgrade(&inner);
        inner.base.on_action(move |event| {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.pass(event.delta_fired, event.aux);
            }
        });
        Ok(Self { inner })
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    // ── Base clock ───────────────────────────────────────────────────

    pub fn interval(&self) -> Duration {
        self.inner.base.interval()
    }

    /// Changes the base resolution and recomputes `times` for every slice.
    /// A running base clock is restarted at the new interval.
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        validate_interval("base_interval", interval)?;
        self.inner.base.set_interval(interval)?;
        let members = self.inner.state.borrow().members.clone();
        for slice in &members {
            slice.rebase(interval);
        }
        if self.is_running() {
            self.inner.base.start()?;
        }
        Ok(())
    }

    pub fn background_mode(&self) -> bool {
        self.inner.base.background_mode()
    }

    /// Takes effect on the next `start`.
    pub fn set_background_mode(&self, background_mode: bool) {
        self.inner.base.set_background_mode(background_mode);
    }

    pub fn radical_mode(&self) -> bool {
        self.inner.state.borrow().radical_mode
    }

    /// Default for slices created from now on.
    pub fn set_radical_mode(&self, radical_mode: bool) {
        self.inner.state.borrow_mut().radical_mode = radical_mode;
    }

    pub fn is_running(&self) -> bool {
        self.inner.base.is_running()
    }

    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            tracing::warn!("scheduler is already running");
            return Ok(());
        }
        self.inner.base.start()
    }

    pub fn stop(&self) {
        if !self.is_running() {
            tracing::warn!("scheduler is already stopped");
            return;
        }
        self.inner.base.stop();
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Returns the slice registered under `tag`, reconfigured and with its
    /// progress cleared, or a fresh one. Activation is deferred.
    pub fn add(&self, interval: Duration, count: Count, tag: Option<&str>) -> Result<TimerSlice> {
        slice_times(interval, self.interval())?;
        validate_count("count", count)?;
        let slice = self.acquire(tag);
        slice.reset(interval, count, None)?;
        Ok(slice)
    }

    /// Returns the slice registered under `tag` untouched, or a fresh,
    /// inactive one.
    pub fn acquire(&self, tag: Option<&str>) -> TimerSlice {
        if let Some(existing) = tag.and_then(|t| self.find(t)) {
            return existing;
        }

        let id = self.inner.next_slice_id.get();
        self.inner.next_slice_id.set(id + 1);
        let mut state = self.inner.state.borrow_mut();
        let slice = TimerSlice::bound(
            id,
            SliceState::new(tag.map(str::to_owned), self.interval(), state.radical_mode),
            Rc::downgrade(&self.inner),
        );
        state.members.push(slice.clone());
        if let Some(tag) = tag {
            state.by_tag.insert(tag.to_owned(), slice.clone());
        }
        tracing::debug!(id, ?tag, "slice created");
        slice
    }

    pub fn find(&self, tag: &str) -> Option<TimerSlice> {
        self.inner.state.borrow().by_tag.get(tag).cloned()
    }

    /// Stops, unregisters and disposes one slice.
    pub fn remove(&self, slice: &TimerSlice) -> bool {
        let removed = {
            let mut state = self.inner.state.borrow_mut();
            let before = state.members.len();
            state.members.retain(|s| s != slice);
            state.active.retain(|s| s != slice);
            state.by_tag.retain(|_, s| s != slice);
            state.members.len() != before
        };
        if removed {
            slice.dispose();
        } else {
            tracing::warn!(id = slice.id(), "slice is not registered here, remove ignored");
        }
        removed
    }

    /// Removes and disposes every slice.
    pub fn clear(&self) {
        let members = {
            let mut state = self.inner.state.borrow_mut();
            state.active.clear();
            state.by_tag.clear();
            std::mem::take(&mut state.members)
        };
        if members.is_empty() {
            tracing::debug!("scheduler already clear");
            return;
        }
        tracing::debug!(slices = members.len(), "clearing scheduler");
        for slice in members {
            slice.dispose();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.borrow().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.inner.state.borrow().active.len()
    }

    /// Active slices in fire order.
    pub fn active_slices(&self) -> Vec<TimerSlice> {
        self.inner.state.borrow().active.clone()
    }

    pub(crate) fn is_active(&self, slice: &TimerSlice) -> bool {
        self.inner.state.borrow().active.contains(slice)
    }

    pub(crate) fn activate(&self, slice: &TimerSlice) {
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.members.contains(slice) {
                tracing::warn!(id = slice.id(), "slice belongs to another scheduler, start ignored");
                return;
            }
        }
        // A handoff may already cover the whole bound.
        if slice.is_exhausted() {
            tracing::debug!(id = slice.id(), "slice bound reached before activation");
            self.deactivate(slice);
            self.finish(slice, &slice.current_event(Signal::Action));
            return;
        }
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.active.contains(slice) {
                state.active.push(slice.clone());
            }
        }
        if slice.radical_mode() && self.is_running() {
            slice.emit(&slice.current_event(Signal::Action));
        }
    }

    pub(crate) fn deactivate(&self, slice: &TimerSlice) {
        self.inner.state.borrow_mut().active.retain(|s| s != slice);
    }

    // ── Tick pass ────────────────────────────────────────────────────

    fn pass(&self, base_delta: u64, aux: AuxData) {
        if base_delta == 0 {
            return;
        }
        // Handlers may add, start or stop slices while the pass runs.
        let snapshot = self.active_slices();
        for slice in snapshot {
            if !self.is_active(&slice) {
                continue;
            }
            let fire = advance(&mut slice.inner.state.borrow_mut(), base_delta, aux);
            let Some(fire) = fire else {
                continue;
            };

            let event: TimerEvent = slice.current_event(Signal::Action);
            match fire {
                Fire::Action => slice.emit(&event),
                Fire::Done => {
                    self.deactivate(&slice);
                    self.finish(&slice, &event);
                }
            }
        }
    }

    /// Final Action, then Done, then the count is cleared for reuse.
    fn finish(&self, slice: &TimerSlice, event: &TimerEvent) {
        slice.emit(event);
        slice.emit(&event.as_signal(Signal::Done));
        slice.inner.state.borrow_mut().fired_count = 0;
    }
}

fn advance(state: &mut SliceState, base_delta: u64, aux: AuxData) -> Option<Fire> {
    let delta = base_delta as f64;
    state.phase += delta;
    if state.phase < state.times {
        return None;
    }
    state.phase %= state.times;
    state.delta_fired = if delta > state.times {
        (delta / state.times).floor() as u64
    } else {
        1
    };
    state.fired_count = state.fired_count.saturating_add(state.delta_fired);
    state.aux = aux;

    if state.count.is_reached(state.fired_count) {
        state.fired_count = state.count.clamp(state.fired_count);
        Some(Fire::Done)
    } else {
        Some(Fire::Action)
    }
}
