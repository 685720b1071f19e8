//! Explicit runtime status markers.
//!
//! Marks are caller-driven and independent of the current-step pointer: a
//! step can be marked `error` while another step is current.  A marked
//! status takes precedence over any computed one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stepflow_types::{RuntimeStatus, StepFailure};

use crate::events::{EventEmitter, FlowEvent};
use crate::store::Store;

/// A status transition on one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub step: String,
    pub previous: Option<RuntimeStatus>,
    pub next: Option<RuntimeStatus>,
}

pub type StatusObserver = Arc<dyn Fn(&StatusChange) + Send + Sync>;

#[derive(Clone)]
pub struct StatusMarker {
    store: Store,
    events: EventEmitter,
    observer: Option<StatusObserver>,
}

impl StatusMarker {
    pub fn new(store: Store, events: EventEmitter, observer: Option<StatusObserver>) -> Self {
        Self {
            store,
            events,
            observer,
        }
    }

    /// Retryable failure.
    pub fn mark_error(&self, step: &str, error: Option<StepFailure>) -> Option<StatusChange> {
        self.set(step, Some(RuntimeStatus::Error), error)
    }

    /// Permanent failure.
    pub fn mark_terminated(&self, step: &str, error: Option<StepFailure>) -> Option<StatusChange> {
        self.set(step, Some(RuntimeStatus::Terminated), error)
    }

    pub fn mark_loading(&self, step: &str) -> Option<StatusChange> {
        self.set(step, Some(RuntimeStatus::Loading), None)
    }

    pub fn mark_skipped(&self, step: &str) -> Option<StatusChange> {
        self.set(step, Some(RuntimeStatus::Skipped), None)
    }

    /// Clear the explicit status; recorded errors stay.
    pub fn mark_idle(&self, step: &str) -> Option<StatusChange> {
        self.set(step, None, None)
    }

    /// Stamp `status` on `step`.  Returns the change, or `None` when the
    /// status was already `status` (observers are skipped in that case).
    fn set(
        &self,
        step: &str,
        status: Option<RuntimeStatus>,
        error: Option<StepFailure>,
    ) -> Option<StatusChange> {
        let mut previous = None;
        self.store.update(|state| {
            previous = state.runtime_status(step);
            state.runtime.entry(step.to_string()).or_default().status = status;
            if let Some(error) = error {
                state.errors.insert(step.to_string(), error);
            }
        });

        if previous == status {
            return None;
        }
        let change = StatusChange {
            step: step.to_string(),
            previous,
            next: status,
        };
        tracing::debug!(step, ?previous, next = ?status, "Runtime status changed");
        if let Some(observer) = &self.observer {
            observer(&change);
        }
        self.events.emit(FlowEvent::StatusChanged(change.clone()));
        Some(change)
    }
}
