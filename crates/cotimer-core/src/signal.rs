//! Observer registration for the two timer signals.
//!
//! Observers run synchronously on the emitting call stack. Emission works
//! on a snapshot of the observer list, so an observer may connect or
//! disconnect (itself included) while it runs.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tickable::AuxData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// One or more logical periods elapsed.
    Action,
    /// A bounded timer reached its count and is now inactive.
    Done,
}

/// Payload delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct TimerEvent {
    pub signal: Signal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub delta_fired: u64,
    pub fired_count: u64,
    pub aux: AuxData,
    pub at: DateTime<Utc>,
}

impl TimerEvent {
    pub fn new(signal: Signal, delta_fired: u64, fired_count: u64, aux: AuxData) -> Self {
        Self {
            signal,
            tag: None,
            delta_fired,
            fired_count,
            aux,
            at: Utc::now(),
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    /// Same counters, different signal.
    pub fn as_signal(&self, signal: Signal) -> Self {
        Self {
            signal,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Rc<RefCell<dyn FnMut(&TimerEvent)>>;

struct Slot {
    id: SubscriptionId,
    signal: Signal,
    handler: Handler,
}

#[derive(Default)]
pub struct Signals {
    next_id: Cell<u64>,
    slots: RefCell<Vec<Slot>>,
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("observers", &self.slots.borrow().len())
            .finish()
    }
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, signal: Signal, handler: F) -> SubscriptionId
    where
        F: FnMut(&TimerEvent) + 'static,
    {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.slots.borrow_mut().push(Slot {
            id,
            signal,
            handler: Rc::new(RefCell::new(handler)),
        });
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub fn clear(&self) {
        self.slots.borrow_mut().clear();
    }

    pub fn len(&self, signal: Signal) -> usize {
        self.slots
            .borrow()
            .iter()
            .filter(|slot| slot.signal == signal)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Invokes every observer of `event.signal`, in connection order.
    pub fn emit(&self, event: &TimerEvent) {
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .slots
            .borrow()
            .iter()
            .filter(|slot| slot.signal == event.signal)
            .map(|slot| (slot.id, Rc::clone(&slot.handler)))
            .collect();

        for (id, handler) in handlers {
            if self.is_connected(id) {
                invoke(id, &handler, event);
            }
        }
    }

    /// Invokes a single observer, if it is still connected to `event.signal`.
    pub fn emit_to(&self, id: SubscriptionId, event: &TimerEvent) {
        let handler = self
            .slots
            .borrow()
            .iter()
            .find(|slot| slot.id == id && slot.signal == event.signal)
            .map(|slot| Rc::clone(&slot.handler));
        if let Some(handler) = handler {
            invoke(id, &handler, event);
        }
    }

    fn is_connected(&self, id: SubscriptionId) -> bool {
        self.slots.borrow().iter().any(|slot| slot.id == id)
    }
}

fn invoke(id: SubscriptionId, handler: &Handler, event: &TimerEvent) {
    let Ok(mut f) = handler.try_borrow_mut() else {
        tracing::warn!(?id, signal = ?event.signal, "observer is already running, skipping re-entrant emit");
        return;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(event)));
    if outcome.is_err() {
        tracing::error!(?id, signal = ?event.signal, tag = ?event.tag, "timer observer panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> TimerEvent {
        TimerEvent::new(Signal::Action, 1, 1, AuxData::default())
    }

    #[test]
    fn emit_only_reaches_matching_signal() {
        let signals = Signals::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        signals.connect(Signal::Action, move |_| h.set(h.get() + 1));
        let h = hits.clone();
        signals.connect(Signal::Done, move |_| h.set(h.get() + 100));

        signals.emit(&action());
        assert_eq!(hits.get(), 1);
        assert_eq!(signals.len(Signal::Action), 1);
        assert_eq!(signals.len(Signal::Done), 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let signals = Signals::new();
        let id = signals.connect(Signal::Action, |_| {});
        assert!(signals.disconnect(id));
        assert!(!signals.disconnect(id));
        assert!(signals.is_empty());
    }

    #[test]
    fn panicking_observer_does_not_stop_the_rest() {
        let signals = Signals::new();
        let hits = Rc::new(Cell::new(0));
        signals.connect(Signal::Action, |_| panic!("observer failure"));
        let h = hits.clone();
        signals.connect(Signal::Action, move |_| h.set(h.get() + 1));

        signals.emit(&action());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn observer_disconnected_mid_emit_is_skipped() {
        let signals = Rc::new(Signals::new());
        let hits = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(None));

        let s = signals.clone();
        let victim = second.clone();
        signals.connect(Signal::Action, move |_| {
            if let Some(id) = victim.get() {
                s.disconnect(id);
            }
        });
        let h = hits.clone();
        second.set(Some(
            signals.connect(Signal::Action, move |_| h.set(h.get() + 1)),
        ));

        signals.emit(&action());
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn emit_to_targets_one_observer() {
        let signals = Signals::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        signals.connect(Signal::Action, move |_| h.set(h.get() + 1));
        let h = hits.clone();
        let id = signals.connect(Signal::Action, move |_| h.set(h.get() + 10));

        signals.emit_to(id, &action());
        assert_eq!(hits.get(), 10);
    }
}
