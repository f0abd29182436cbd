//! Mode-selecting timer facade.
//!
//! A [`Timer`] owns at most one live [`PhysicalDriver`], created fresh on
//! every `start` and released on every `stop`, so a restarted timer always
//! counts from zero. Observers only ever see the facade: driver ticks are
//! re-emitted as the facade's own Action/Done after its aux data is copied.
//!
//! ## State Transitions
//!
//! ```text
//! Stopped -> Running -> (Finished ->) Stopped
//! ```
//!
//! `Finished` is a bounded timer that emitted Done: the ticker is gone and
//! `is_running()` is false, but the driver stays readable until `stop`.

use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::driver::{DriverKind, PhysicalDriver};
use crate::error::{ConfigError, Result};
use crate::runtime::{EventLoop, TickerId};
use crate::signal::{Signal, Signals, SubscriptionId, TimerEvent};
use crate::tickable::{validate_count, validate_interval, AuxData, Count, Tickable};

struct FacadeState {
    interval: Duration,
    count: Count,
    background_mode: bool,
    /// Periods a best-effort callback counts for.
    delta_step: u64,
    tag: Option<String>,
    driver: Option<Box<dyn PhysicalDriver>>,
    driver_kind: Option<DriverKind>,
    ticker: Option<TickerId>,
    aux: AuxData,
}

struct TimerShared {
    state: RefCell<FacadeState>,
    signals: Signals,
    event_loop: EventLoop,
}

impl Drop for TimerShared {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().ticker.take() {
            self.event_loop.cancel(id);
        }
    }
}

/// Periodic timer that picks its driver from `background_mode`.
///
/// Clones are handles to the same timer. Dropping the last handle cancels
/// its platform callback.
#[derive(Clone)]
pub struct Timer {
    shared: Rc<TimerShared>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Timer")
            .field("interval", &state.interval)
            .field("count", &state.count)
            .field("background_mode", &state.background_mode)
            .field("tag", &state.tag)
            .field("running", &state.driver.as_ref().is_some_and(|d| d.is_running()))
            .finish()
    }
}

impl Timer {
    pub fn new(event_loop: &EventLoop, interval: Duration, count: Count) -> Result<Self> {
        let state = FacadeState {
            interval: validate_interval("interval", interval)?,
            count: validate_count("count", count)?,
            background_mode: false,
            delta_step: 1,
            tag: None,
            driver: None,
            driver_kind: None,
            ticker: None,
            aux: AuxData::default(),
        };
        Ok(Self {
            shared: Rc::new(TimerShared {
                state: RefCell::new(state),
                signals: Signals::new(),
                event_loop: event_loop.clone(),
            }),
        })
    }

    /// One-shot timeout: runs `f` once, `after` from now, unless the timer
    /// is stopped or dropped first.
    pub fn delay<F>(event_loop: &EventLoop, after: Duration, f: F) -> Result<Self>
    where
        F: FnOnce() + 'static,
    {
        let timer = Self::new(event_loop, after, Count::Times(1))?;
        timer.set_background_mode(true);
        let mut f = Some(f);
        timer.on_done(move |_| {
            if let Some(f) = f.take() {
                f();
            }
        });
        timer.start()?;
        Ok(timer)
    }

    /// Resolves once `duration` has elapsed on `event_loop`.
    pub fn sleep(event_loop: &EventLoop, duration: Duration) -> Result<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel::<()>();
        let timer = Self::delay(event_loop, duration, move || {
            let _ = tx.send(());
        })?;
        Ok(async move {
            let _timer = timer;
            let _ = rx.await;
        })
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Takes effect on the next `start`.
    pub fn set_interval(&self, interval: Duration) -> Result<()> {
        self.shared.state.borrow_mut().interval = validate_interval("interval", interval)?;
        Ok(())
    }

    /// Takes effect on the next `start`.
    pub fn set_count(&self, count: Count) -> Result<()> {
        self.shared.state.borrow_mut().count = validate_count("count", count)?;
        Ok(())
    }

    pub fn background_mode(&self) -> bool {
        self.shared.state.borrow().background_mode
    }

    /// Selects the drift-corrected driver on the next `start`.
    pub fn set_background_mode(&self, background_mode: bool) {
        self.shared.state.borrow_mut().background_mode = background_mode;
    }

    /// Periods each best-effort callback counts for. Applied to the live
    /// driver and kept for later starts; the drift-corrected driver measures
    /// its own.
    pub fn set_delta_fired(&self, delta: u64) -> Result<()> {
        if delta == 0 {
            return Err(ConfigError::invalid("delta_fired", "must be at least 1").into());
        }
        let mut state = self.shared.state.borrow_mut();
        state.delta_step = delta;
        if let Some(driver) = state.driver.as_mut() {
            driver.set_delta_fired(delta);
        }
        Ok(())
    }

    pub fn tag(&self) -> Option<String> {
        self.shared.state.borrow().tag.clone()
    }

    pub fn set_tag(&self, tag: Option<String>) {
        self.shared.state.borrow_mut().tag = tag;
    }

    /// The variant the live driver was built as, if any.
    pub fn driver_kind(&self) -> Option<DriverKind> {
        self.shared.state.borrow().driver_kind
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn start(&self) -> Result<()> {
        self.stop();
        let now = self.shared.event_loop.now();
        let (interval, kind, mut driver) = {
            let state = self.shared.state.borrow();
            let kind = DriverKind::for_background(state.background_mode);
            let mut driver = kind.build(state.interval, state.count)?;
            driver.set_delta_fired(state.delta_step);
            (state.interval, kind, driver)
        };
        driver.start(now);

        let weak: Weak<TimerShared> = Rc::downgrade(&self.shared);
        let ticker = self.shared.event_loop.every(interval, move |now| {
            if let Some(shared) = weak.upgrade() {
                Timer { shared }.on_platform_tick(now);
            }
        });

        let mut state = self.shared.state.borrow_mut();
        state.aux = AuxData::default();
        state.driver = Some(driver);
        state.driver_kind = Some(kind);
        state.ticker = Some(ticker);
        tracing::debug!(?interval, ?kind, tag = ?state.tag, "timer started");
        Ok(())
    }

    /// Releases the driver and its platform callback. Calling it on a
    /// stopped timer does nothing.
    pub fn stop(&self) {
        let (ticker, driver) = {
            let mut state = self.shared.state.borrow_mut();
            state.driver_kind = None;
            (state.ticker.take(), state.driver.take())
        };
        if let Some(id) = ticker {
            self.shared.event_loop.cancel(id);
        }
        match driver {
            Some(mut driver) => {
                driver.stop();
                tracing::debug!(tag = ?self.tag(), "timer stopped");
            }
            None => tracing::trace!(tag = ?self.tag(), "stop on a stopped timer"),
        }
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn on_action<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&TimerEvent) + 'static,
    {
        self.shared.signals.connect(Signal::Action, f)
    }

    pub fn on_done<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&TimerEvent) + 'static,
    {
        self.shared.signals.connect(Signal::Done, f)
    }

    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.shared.signals.disconnect(id)
    }

    /// Emits a manual Action with `delta_fired = 0`; `fired_count` is
    /// unchanged.
    pub fn trigger(&self) {
        let event = self.event(Signal::Action, 0, self.fired_count(), self.aux_data());
        self.shared.signals.emit(&event);
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn on_platform_tick(&self, now: Instant) {
        let (tick, ticker) = {
            let mut state = self.shared.state.borrow_mut();
            let Some(driver) = state.driver.as_mut() else {
                return;
            };
            let Some(tick) = driver.tick(now) else {
                return;
            };
            state.aux = tick.aux;
            let ticker = if tick.finished { state.ticker.take() } else { None };
            (tick, ticker)
        };
        if let Some(id) = ticker {
            self.shared.event_loop.cancel(id);
        }

        let action = self.event(Signal::Action, tick.delta_fired, tick.fired_count, tick.aux);
        self.shared.signals.emit(&action);
        if tick.finished {
            tracing::debug!(fired = tick.fired_count, tag = ?action.tag, "timer done");
            self.shared.signals.emit(&action.as_signal(Signal::Done));
        }
    }

    fn event(&self, signal: Signal, delta_fired: u64, fired_count: u64, aux: AuxData) -> TimerEvent {
        TimerEvent::new(signal, delta_fired, fired_count, aux).with_tag(self.tag())
    }
}

impl Tickable for Timer {
    fn interval(&self) -> Duration {
        self.shared.state.borrow().interval
    }

    fn count(&self) -> Count {
        self.shared.state.borrow().count
    }

    fn fired_count(&self) -> u64 {
        self.shared
            .state
            .borrow()
            .driver
            .as_ref()
            .map_or(0, |d| d.fired_count())
    }

    fn delta_fired(&self) -> u64 {
        self.shared
            .state
            .borrow()
            .driver
            .as_ref()
            .map_or(0, |d| d.delta_fired())
    }

    fn aux_data(&self) -> AuxData {
        self.shared.state.borrow().aux
    }

    fn is_running(&self) -> bool {
        self.shared
            .state
            .borrow()
            .driver
            .as_ref()
            .is_some_and(|d| d.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;
    use std::cell::Cell;

    fn manual() -> (ManualClock, EventLoop) {
        let clock = ManualClock::new();
        let event_loop = EventLoop::with_clock(Rc::new(clock.clone()));
        (clock, event_loop)
    }

    fn step(clock: &ManualClock, event_loop: &EventLoop, by: Duration) {
        clock.advance(by);
        event_loop.turn();
    }

    #[test]
    fn bounded_timer_fires_count_actions_then_done() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_secs(1), Count::Times(3)).unwrap();
        timer.set_background_mode(true);

        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        timer.on_action(move |e| l.borrow_mut().push((e.signal, e.fired_count)));
        let l = log.clone();
        timer.on_done(move |e| l.borrow_mut().push((e.signal, e.fired_count)));

        timer.start().unwrap();
        for _ in 0..3 {
            step(&clock, &event_loop, Duration::from_secs(1));
        }

        assert_eq!(
            *log.borrow(),
            vec![
                (Signal::Action, 1),
                (Signal::Action, 2),
                (Signal::Action, 3),
                (Signal::Done, 3),
            ]
        );
        assert!(!timer.is_running());
        assert_eq!(timer.fired_count(), 3);
        assert_eq!(event_loop.pending_tickers(), 0);

        step(&clock, &event_loop, Duration::from_secs(1));
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn background_mode_selects_drift_corrected_driver() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_secs(1), Count::Unbounded).unwrap();
        assert_eq!(timer.driver_kind(), None);

        timer.start().unwrap();
        assert_eq!(timer.driver_kind(), Some(DriverKind::BestEffort));

        timer.set_background_mode(true);
        timer.start().unwrap();
        assert_eq!(timer.driver_kind(), Some(DriverKind::DriftCorrected));

        // A 3.5s stall is reported as three periods in one event.
        step(&clock, &event_loop, Duration::from_millis(3500));
        assert_eq!(timer.delta_fired(), 3);
        assert_eq!(timer.fired_count(), 3);
        assert_eq!(timer.aux_data().overflow_secs, Some(0.5));
    }

    #[test]
    fn stop_is_idempotent_and_clears_proxies() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_millis(100), Count::Unbounded).unwrap();
        timer.stop();

        timer.start().unwrap();
        step(&clock, &event_loop, Duration::from_millis(100));
        assert_eq!(timer.fired_count(), 1);

        timer.stop();
        timer.stop();
        assert!(!timer.is_running());
        assert_eq!(timer.fired_count(), 0);
        assert_eq!(timer.delta_fired(), 0);
        assert_eq!(event_loop.pending_tickers(), 0);
    }

    #[test]
    fn restart_counts_from_zero() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_millis(100), Count::Unbounded).unwrap();
        timer.start().unwrap();
        step(&clock, &event_loop, Duration::from_millis(100));
        step(&clock, &event_loop, Duration::from_millis(100));
        assert_eq!(timer.fired_count(), 2);

        timer.start().unwrap();
        assert_eq!(timer.fired_count(), 0);
        assert_eq!(event_loop.pending_tickers(), 1);
    }

    #[test]
    fn done_handler_may_stop_the_timer() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_millis(100), Count::Times(1)).unwrap();
        let handle = timer.clone();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        timer.on_done(move |_| {
            handle.stop();
            d.set(true);
        });

        timer.start().unwrap();
        step(&clock, &event_loop, Duration::from_millis(100));
        assert!(done.get());
        assert_eq!(timer.fired_count(), 0);
    }

    #[test]
    fn delta_fired_setting_reaches_the_best_effort_driver() {
        let (clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_millis(100), Count::Times(6)).unwrap();
        assert!(timer.set_delta_fired(0).is_err());
        timer.set_delta_fired(3).unwrap();
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        timer.on_done(move |_| d.set(true));

        timer.start().unwrap();
        step(&clock, &event_loop, Duration::from_millis(100));
        assert_eq!((timer.delta_fired(), timer.fired_count()), (3, 3));
        step(&clock, &event_loop, Duration::from_millis(100));
        assert!(done.get());
        assert_eq!(timer.fired_count(), 6);

        // Kept across restarts.
        timer.start().unwrap();
        step(&clock, &event_loop, Duration::from_millis(100));
        assert_eq!(timer.fired_count(), 3);
    }

    #[test]
    fn trigger_emits_without_counting() {
        let (_clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_secs(1), Count::Unbounded).unwrap();
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        timer.on_action(move |e| s.set(Some((e.delta_fired, e.fired_count))));

        timer.trigger();
        assert_eq!(seen.get(), Some((0, 0)));
    }

    #[test]
    fn dropping_the_handle_cancels_the_ticker() {
        let (_clock, event_loop) = manual();
        let timer = Timer::new(&event_loop, Duration::from_secs(1), Count::Unbounded).unwrap();
        timer.start().unwrap();
        assert_eq!(event_loop.pending_tickers(), 1);
        drop(timer);
        assert_eq!(event_loop.pending_tickers(), 0);
    }

    #[test]
    fn delay_fires_once_and_can_be_cancelled() {
        let (clock, event_loop) = manual();
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        let _kept = Timer::delay(&event_loop, Duration::from_secs(10), move || f.set(f.get() + 1)).unwrap();
        let f = fired.clone();
        let cancelled =
            Timer::delay(&event_loop, Duration::from_secs(10), move || f.set(f.get() + 100)).unwrap();
        cancelled.stop();

        step(&clock, &event_loop, Duration::from_secs(30));
        step(&clock, &event_loop, Duration::from_secs(30));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn degenerate_configuration_is_rejected() {
        let (_clock, event_loop) = manual();
        assert!(Timer::new(&event_loop, Duration::ZERO, Count::Unbounded).is_err());
        let timer = Timer::new(&event_loop, Duration::from_secs(1), Count::Unbounded).unwrap();
        assert!(timer.set_interval(Duration::ZERO).is_err());
        assert!(timer.set_count(Count::Times(0)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_resolves_after_the_duration() {
        let event_loop = EventLoop::new();
        let started = Instant::now();
        let sleep = Timer::sleep(&event_loop, Duration::from_secs(2)).unwrap();
        event_loop.run_until(sleep).await;
        assert!(Instant::now() - started >= Duration::from_secs(2));
        assert_eq!(event_loop.pending_tickers(), 0);
    }
}
