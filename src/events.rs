//! Event subscriptions.
//!
//! Handlers are kept per event name in registration order. Dispatch runs
//! every handler for the name, in that order, on the same payload; a handler
//! that fails (returns `Err` or panics) is logged and the rest still run.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::warn;

/// An event handler
pub type EventHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Identifier of one registration
pub type SubscriptionId = u64;

struct Entry {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
struct EventBusInner {
    handlers: HashMap<String, Vec<Entry>>,
    next_id: SubscriptionId,
}

/// Outcome of dispatching one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers invoked
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

/// Mapping from event name to ordered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.handlers.entry(name.clone()).or_default().push(Entry {
            id,
            handler: Arc::new(handler),
        });

        Subscription {
            name,
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove one registration; returns `false` if it was already gone
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        remove_entry(&self.inner, name, id)
    }

    /// Invoke every handler registered for `name`
    ///
    /// The handler list is snapshotted first, so handlers may subscribe,
    /// unsubscribe or emit without deadlocking. Registrations made during a
    /// dispatch take effect from the next event.
    pub fn dispatch(&self, name: &str, payload: &Value) -> DispatchReport {
        let snapshot: Vec<(SubscriptionId, EventHandler)> = {
            let inner = self.inner.lock();
            match inner.handlers.get(name) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id, Arc::clone(&e.handler)))
                    .collect(),
                None => return DispatchReport::default(),
            }
        };

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(event = %name, subscription = id, "Event handler failed: {:#}", err);
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(event = %name, subscription = id, "Event handler panicked");
                }
            }
        }
        report
    }

    /// Number of handlers for one event
    pub fn handler_count(&self, name: &str) -> usize {
        self.inner.lock().handlers.get(name).map_or(0, Vec::len)
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        self.inner.lock().handlers.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_entry(inner: &Mutex<EventBusInner>, name: &str, id: SubscriptionId) -> bool {
    let mut inner = inner.lock();
    let Some(entries) = inner.handlers.get_mut(name) else {
        return false;
    };
    let before = entries.len();
    entries.retain(|e| e.id != id);
    let removed = entries.len() != before;
    if entries.is_empty() {
        inner.handlers.remove(name);
    }
    removed
}

/// Handle to one registration
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    id: SubscriptionId,
    bus: Weak<Mutex<EventBusInner>>,
}

impl Subscription {
    /// Event name this handler listens to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration id
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler; returns `false` if it was already removed
    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => remove_entry(&inner, &self.name, self.id),
            None => false,
        }
    }
}
