//! Lifecycle event notification
//!
//! Observers register per event kind and are invoked in registration
//! order. A misbehaving observer is isolated so it can neither abort the
//! state transition that produced the event nor starve later observers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Lifecycle signals emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// First successful connect of this manager
    Connected,
    /// Connection restored and subscriptions replayed after a drop
    Reconnected,
    /// Something went wrong; carries a description
    Error(String),
    /// Graceful shutdown finished
    Closed,
}

impl BrokerEvent {
    /// The kind used for observer registration
    pub fn kind(&self) -> EventKind {
        match self {
            BrokerEvent::Connected => EventKind::Connected,
            BrokerEvent::Reconnected => EventKind::Reconnected,
            BrokerEvent::Error(_) => EventKind::Error,
            BrokerEvent::Closed => EventKind::Closed,
        }
    }
}

/// Registration key for one event variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Reconnected,
    Error,
    Closed,
}

type EventCallback = Box<dyn Fn(&BrokerEvent) + Send + Sync>;

struct Observer {
    callback: EventCallback,
    once: bool,
}

/// Per-kind observer lists with ordered, isolated dispatch
#[derive(Default)]
pub struct EventNotifier {
    observers: Mutex<HashMap<EventKind, Vec<Observer>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer invoked on every matching event
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.push(kind, Box::new(callback), false);
    }

    /// Register an observer removed after its first invocation
    pub fn once<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.push(kind, Box::new(callback), true);
    }

    fn push(&self, kind: EventKind, callback: EventCallback, once: bool) {
        let mut observers = self.lock();
        observers
            .entry(kind)
            .or_default()
            .push(Observer { callback, once });
    }

    /// Dispatch an event to its observers in registration order
    pub fn emit(&self, event: &BrokerEvent) {
        let kind = event.kind();
        // Take the list out so callbacks can register observers without
        // deadlocking on the registry lock
        let batch = {
            let mut observers = self.lock();
            match observers.get_mut(&kind) {
                Some(list) => std::mem::take(list),
                None => return,
            }
        };

        let mut kept = Vec::with_capacity(batch.len());
        for observer in batch {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (observer.callback)(event)));
            if outcome.is_err() {
                warn!(kind = ?kind, "event observer panicked; continuing with remaining observers");
            }
            if !observer.once {
                kept.push(observer);
            }
        }

        let mut observers = self.lock();
        let slot = observers.entry(kind).or_default();
        let added_during_emit = std::mem::take(slot);
        kept.extend(added_during_emit);
        *slot = kept;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<Observer>>> {
        // A panicking observer must not poison dispatch for everyone else
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(EventKind, usize)> = self
            .lock()
            .iter()
            .map(|(kind, list)| (*kind, list.len()))
            .collect();
        f.debug_struct("EventNotifier")
            .field("observers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_observers_run_in_registration_order() {
        let notifier = EventNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            notifier.on(EventKind::Connected, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        notifier.emit(&BrokerEvent::Connected);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_once_observer_fires_a_single_time() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        notifier.once(EventKind::Closed, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(&BrokerEvent::Closed);
        notifier.emit(&BrokerEvent::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_does_not_stop_the_rest() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        notifier.on(EventKind::Error, |_| panic!("observer bug"));
        let count_clone = count.clone();
        notifier.on(EventKind::Error, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(&BrokerEvent::Error("boom".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Dispatch still works afterwards
        notifier.emit(&BrokerEvent::Error("again".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_event_carries_description() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(None));

        let seen_clone = seen.clone();
        notifier.on(EventKind::Error, move |event| {
            if let BrokerEvent::Error(description) = event {
                *seen_clone.lock().unwrap() = Some(description.clone());
            }
        });

        notifier.emit(&BrokerEvent::Error("queue gone".to_string()));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("queue gone"));
    }

    #[test]
    fn test_events_only_reach_matching_kind() {
        let notifier = EventNotifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        notifier.on(EventKind::Reconnected, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(&BrokerEvent::Connected);
        notifier.emit(&BrokerEvent::Closed);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        notifier.emit(&BrokerEvent::Reconnected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
