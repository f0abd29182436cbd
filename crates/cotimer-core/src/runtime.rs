//! The single serialized execution context every timer runs on.
//!
//! [`EventLoop`] owns the platform callbacks (tickers) that physical drivers
//! register, plus a queue of zero-delay deferred tasks. Nothing in this
//! crate spawns threads: a loop is driven either manually through
//! [`EventLoop::turn`] (tests, embedding in another loop) or on a tokio
//! current-thread runtime through [`EventLoop::run_until`].
//!
//! ```ignore
//! let event_loop = EventLoop::new();
//! let sleep = Timer::sleep(&event_loop, Duration::from_secs(1))?;
//! event_loop.run_until(sleep).await;
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Time source consumed by the loop and every driver on it.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, which follows real time unless paused in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, at: Instant) {
        self.now.set(at);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickerId(u64);

enum Callback {
    Every(Box<dyn FnMut(Instant)>),
    Once(Box<dyn FnOnce(Instant)>),
}

struct Ticker {
    deadline: Instant,
    period: Option<Duration>,
    /// Taken out while the callback runs.
    callback: Option<Callback>,
}

struct LoopInner {
    clock: Rc<dyn Clock>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    tickers: RefCell<BTreeMap<TickerId, Ticker>>,
    next_id: Cell<u64>,
    wake: Notify,
}

/// Handle to a single-threaded timer loop. Clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("tickers", &self.inner.tickers.borrow().len())
            .field("deferred", &self.inner.deferred.borrow().len())
            .finish()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                clock,
                deferred: RefCell::new(VecDeque::new()),
                tickers: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// Queues `task` to run once the current call stack has unwound, before
    /// the next ticker fires.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.deferred.borrow_mut().push_back(Box::new(task));
        self.inner.wake.notify_one();
    }

    /// Registers a callback invoked roughly every `period`, first at
    /// `now + period`.
    pub fn every<F>(&self, period: Duration, callback: F) -> TickerId
    where
        F: FnMut(Instant) + 'static,
    {
        self.insert(period, Some(period), Callback::Every(Box::new(callback)))
    }

    /// Registers a callback invoked once, `delay` from now.
    pub fn once<F>(&self, delay: Duration, callback: F) -> TickerId
    where
        F: FnOnce(Instant) + 'static,
    {
        self.insert(delay, None, Callback::Once(Box::new(callback)))
    }

    /// Returns false when the ticker was already gone. Safe to call from the
    /// ticker's own callback.
    pub fn cancel(&self, id: TickerId) -> bool {
        let removed = self.inner.tickers.borrow_mut().remove(&id);
        removed.is_some()
    }

    pub fn pending_tickers(&self) -> usize {
        self.inner.tickers.borrow().len()
    }

    pub fn pending_deferred(&self) -> usize {
        self.inner.deferred.borrow().len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .tickers
            .borrow()
            .values()
            .filter(|t| t.callback.is_some())
            .map(|t| t.deadline)
            .min()
    }

    /// Drains the deferred queue, including tasks queued by deferred tasks.
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.inner.deferred.borrow_mut().pop_front();
            let Some(task) = task else { break };
            task();
            ran += 1;
        }
        ran
    }

    /// Runs deferred work and fires every ticker due at the clock's current
    /// time, each at most once. Returns the number of ticker callbacks fired.
    pub fn turn(&self) -> usize {
        self.run_deferred();
        let now = self.now();
        let due: Vec<TickerId> = {
            let tickers = self.inner.tickers.borrow();
            let mut due: Vec<(Instant, TickerId)> = tickers
                .iter()
                .filter(|(_, t)| t.callback.is_some() && t.deadline <= now)
                .map(|(id, t)| (t.deadline, *id))
                .collect();
            due.sort();
            due.into_iter().map(|(_, id)| id).collect()
        };

        let mut fired = 0;
        for id in due {
            if self.fire(id, now) {
                fired += 1;
                self.run_deferred();
            }
        }
        if fired > 0 {
            tracing::trace!(fired, "event loop turn");
        }
        fired
    }

    /// Drives the loop on the current tokio runtime until `until` resolves.
    pub async fn run_until<F>(&self, until: F) -> F::Output
    where
        F: Future,
    {
        tokio::pin!(until);
        loop {
            self.turn();
            let next = self.next_deadline();
            tokio::select! {
                biased;
                out = &mut until => return out,
                () = self.inner.wake.notified() => {}
                () = sleep_until(next) => {}
            }
        }
    }

    pub async fn run_for(&self, duration: Duration) {
        self.run_until(tokio::time::sleep(duration)).await;
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, callback: Callback) -> TickerId {
        let id = TickerId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        self.inner.tickers.borrow_mut().insert(
            id,
            Ticker {
                deadline: self.now() + delay,
                period,
                callback: Some(callback),
            },
        );
        self.inner.wake.notify_one();
        id
    }

    fn fire(&self, id: TickerId, now: Instant) -> bool {
        let callback = {
            let mut tickers = self.inner.tickers.borrow_mut();
            let Some(ticker) = tickers.get_mut(&id) else {
                return false;
            };
            match ticker.period {
                Some(period) => {
                    let next = ticker.deadline + period;
                    ticker.deadline = if next > now { next } else { now + period };
                    ticker.callback.take()
                }
                None => tickers.remove(&id).and_then(|t| t.callback),
            }
        };

        match callback {
            Some(Callback::Every(mut f)) => {
                f(now);
                // Put it back unless the callback cancelled its own ticker.
                if let Some(ticker) = self.inner.tickers.borrow_mut().get_mut(&id) {
                    ticker.callback = Some(Callback::Every(f));
                }
                true
            }
            Some(Callback::Once(f)) => {
                f(now);
                true
            }
            None => false,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> (ManualClock, EventLoop) {
        let clock = ManualClock::new();
        let event_loop = EventLoop::with_clock(Rc::new(clock.clone()));
        (clock, event_loop)
    }

    #[test]
    fn every_fires_once_per_due_turn() {
        let (clock, event_loop) = manual();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        event_loop.every(Duration::from_millis(100), move |_| h.set(h.get() + 1));

        assert_eq!(event_loop.turn(), 0);
        clock.advance(Duration::from_millis(100));
        assert_eq!(event_loop.turn(), 1);
        clock.advance(Duration::from_millis(50));
        assert_eq!(event_loop.turn(), 0);
        clock.advance(Duration::from_millis(50));
        assert_eq!(event_loop.turn(), 1);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn late_turn_collapses_missed_callbacks() {
        let (clock, event_loop) = manual();
        let start = event_loop.now();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        event_loop.every(Duration::from_secs(1), move |_| h.set(h.get() + 1));

        clock.advance(Duration::from_millis(3500));
        assert_eq!(event_loop.turn(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(
            event_loop.next_deadline(),
            Some(start + Duration::from_millis(4500))
        );
    }

    #[test]
    fn once_fires_a_single_time() {
        let (clock, event_loop) = manual();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        event_loop.once(Duration::from_secs(1), move |_| h.set(h.get() + 1));

        clock.advance(Duration::from_secs(5));
        event_loop.turn();
        clock.advance(Duration::from_secs(5));
        event_loop.turn();
        assert_eq!(hits.get(), 1);
        assert_eq!(event_loop.pending_tickers(), 0);
    }

    #[test]
    fn ticker_can_cancel_itself() {
        let (clock, event_loop) = manual();
        let hits = Rc::new(Cell::new(0));
        let own_id = Rc::new(Cell::new(None));

        let lp = event_loop.clone();
        let h = hits.clone();
        let me = own_id.clone();
        let id = event_loop.every(Duration::from_millis(10), move |_| {
            h.set(h.get() + 1);
            if let Some(id) = me.get() {
                lp.cancel(id);
            }
        });
        own_id.set(Some(id));

        for _ in 0..3 {
            clock.advance(Duration::from_millis(10));
            event_loop.turn();
        }
        assert_eq!(hits.get(), 1);
        assert!(!event_loop.cancel(id));
    }

    #[test]
    fn deferred_tasks_run_before_the_next_ticker() {
        let (clock, event_loop) = manual();
        let order = Rc::new(RefCell::new(Vec::new()));

        let lp = event_loop.clone();
        let o = order.clone();
        event_loop.every(Duration::from_millis(10), move |_| {
            o.borrow_mut().push("tick");
            let o = o.clone();
            lp.defer(move || o.borrow_mut().push("deferred"));
        });
        let o = order.clone();
        event_loop.every(Duration::from_millis(10), move |_| o.borrow_mut().push("second"));

        clock.advance(Duration::from_millis(10));
        event_loop.turn();
        assert_eq!(*order.borrow(), vec!["tick", "deferred", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_drives_tickers_on_tokio_time() {
        let event_loop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        event_loop.every(Duration::from_millis(100), move |_| h.set(h.get() + 1));

        event_loop.run_for(Duration::from_millis(1050)).await;
        assert_eq!(hits.get(), 10);
    }
}
