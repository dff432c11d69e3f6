//! Synchronous fan-out of session changes to view callbacks.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, Weak},
};

use shared::domain::Session;
use tracing::error;

type Listener = Arc<dyn Fn(&Session, &Session) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Listeners receive `(next, prev)` in subscription order. A panicking
/// listener is logged and skipped; the others still run.
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Arc<Mutex<Listeners>>,
}

/// Handle returned by [`Notifier::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            guard.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Session, &Session) + Send + Sync + 'static,
    {
        let mut guard = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.next_id += 1;
        let id = guard.next_id;
        guard.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Returns how many listeners completed without panicking.
    pub fn publish(&self, next: &Session, prev: &Session) -> usize {
        let entries: Vec<(u64, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone();

        let mut delivered = 0;
        for (id, listener) in entries {
            match catch_unwind(AssertUnwindSafe(|| listener(next, prev))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(listener_id = id, "notifier: listener panicked"),
            }
        }
        delivered
    }
}
