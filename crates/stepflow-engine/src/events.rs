//! Flow event bus.
//!
//! Delivers [`FlowEvent`]s to every registered listener synchronously, in
//! registration order.  The bus is scoped to one flow instance; exit hooks
//! and loaders reach it through [`HookScope::emit`](crate::hooks::HookScope::emit).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepflow_types::TransitionEvent;

use crate::runtime::StatusChange;
use crate::store::lock;

/// Events broadcast by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// Emitted by callers or hooks; the engine does not interpret it.
    Custom { name: String, payload: Value },
    Transitioned(TransitionEvent),
    StatusChanged(StatusChange),
    Reset,
}

impl FlowEvent {
    pub fn custom(name: impl Into<String>, payload: Value) -> Self {
        FlowEvent::Custom {
            name: name.into(),
            payload,
        }
    }
}

type EventListener = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

/// Instance-scoped observer set.
///
/// Cloning an `EventEmitter` yields another handle to the same listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

#[derive(Default)]
struct EmitterInner {
    listeners: Mutex<Vec<(u64, EventListener)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to all current listeners.
    ///
    /// With no listeners the event is silently dropped.
    pub fn emit(&self, event: FlowEvent) {
        let listeners: Vec<EventListener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&FlowEvent) + Send + Sync + 'static) -> EventSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        EventSubscription {
            id,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }
}

/// Handle returned by [`EventEmitter::subscribe`].
pub struct EventSubscription {
    id: u64,
    emitter: Weak<EmitterInner>,
}

impl EventSubscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.emitter.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(emitter: &EventEmitter, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> EventSubscription {
        let log = Arc::clone(log);
        emitter.subscribe(move |event| {
            if let FlowEvent::Custom { name, .. } = event {
                lock(&log).push(format!("{tag}:{name}"));
            }
        })
    }

    #[test]
    fn delivers_in_registration_order() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = recorder(&emitter, "first", &log);
        let _b = recorder(&emitter, "second", &log);

        emitter.emit(FlowEvent::custom("saved", json!(null)));

        assert_eq!(*lock(&log), vec!["first:saved", "second:saved"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&emitter, "first", &log);
        let _b = recorder(&emitter, "second", &log);

        a.unsubscribe();
        emitter.emit(FlowEvent::custom("ping", json!(1)));

        assert_eq!(*lock(&log), vec!["second:ping"]);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new();
        emitter.emit(FlowEvent::Reset);
    }

    #[test]
    fn clones_share_listeners() {
        let emitter = EventEmitter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = recorder(&emitter, "only", &log);

        emitter.clone().emit(FlowEvent::custom("via_clone", json!({})));
        assert_eq!(lock(&log).len(), 1);
    }

    #[test]
    fn custom_event_serializes_with_payload() {
        let event = FlowEvent::custom("upload", json!({"bytes": 42}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["Custom"]["name"], "upload");
        assert_eq!(value["Custom"]["payload"]["bytes"], 42);
    }
}
