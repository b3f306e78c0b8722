//! Lifecycle notifications.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
};

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitType {
    Ready,
    DatafileSet,
    AttributeSet,
    AttributeRemoved,
    EventTracked,
}

/// Details passed to listeners, e.g. `{"attributeName": "userId"}`.
pub type EventDetails = serde_json::Map<String, Value>;

type Listener = Arc<dyn Fn(&EventDetails) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, EmitType, Listener)>,
}

/// Multi-listener event emitter. Cloning produces a handle to the same set of listeners.
#[derive(Clone, Default)]
pub struct Emitter {
    listeners: Arc<Mutex<Listeners>>,
}

impl Emitter {
    pub fn new() -> Emitter {
        Emitter::default()
    }

    /// Register a listener. Listeners of the same type are called in registration order.
    pub fn on(
        &self,
        emit_type: EmitType,
        callback: impl Fn(&EventDetails) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, emit_type, Arc::new(callback)));

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Call all listeners of `emit_type`. A panicking listener is logged and does not prevent the
    /// remaining ones from running.
    pub fn trigger(&self, emit_type: EmitType, details: &EventDetails) {
        // Snapshot so that listeners may subscribe or unsubscribe while being called.
        let snapshot: Vec<Listener> = {
            let Ok(listeners) = self.listeners.lock() else {
                return;
            };
            listeners
                .entries
                .iter()
                .filter(|(_, t, _)| *t == emit_type)
                .map(|(_, _, listener)| listener.clone())
                .collect()
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(details))).is_err() {
                log::error!(target: "eventvisor", emit_type:serde; "listener panicked");
            }
        }
    }

    pub fn clear_all(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.entries.clear();
        }
    }
}

/// Handle returned by [`Emitter::on`]. Dropping it keeps the listener registered.
#[derive(Debug, Clone)]
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Subscription {
    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        if let Ok(mut listeners) = listeners.lock() {
            listeners.entries.retain(|(id, _, _)| *id != self.id);
        };
    }
}
