//! Copy-on-write updates to the shared context and per-step data.

use serde::Serialize;
use serde_json::Value;
use stepflow_types::Context;

use crate::store::Store;

/// The current step, its captured payload, and the shared context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStep {
    pub step: String,
    pub data: Option<Value>,
    pub context: Context,
}

/// Writes context and step data through the store.
///
/// Each call performs exactly one store replacement.  No shape checks happen
/// here; payload validation belongs to the step's validator.
#[derive(Clone)]
pub struct ContextManager {
    store: Store,
}

impl ContextManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Apply `mutator` to a fresh clone of the context and commit it.
    ///
    /// The mutator runs outside the store lock, so it may read the flow.
    pub fn update_context(&self, mutator: impl FnOnce(&mut Context)) {
        let mut context = self.store.get().context.clone();
        mutator(&mut context);
        self.store.update(|state| state.context = context);
    }

    /// Replace the payload for `step` and clear any stale error recorded for it.
    pub fn set_step_data(&self, step: &str, value: Value) {
        self.store.update(|state| {
            state.data.insert(step.to_string(), value);
            state.errors.remove(step);
        });
    }

    pub fn context(&self) -> Context {
        self.store.get().context.clone()
    }

    pub fn step_data(&self, step: &str) -> Option<Value> {
        self.store.get().step_data(step).cloned()
    }

    pub fn current(&self) -> CurrentStep {
        let state = self.store.get();
        CurrentStep {
            step: state.step.clone(),
            data: state.step_data(&state.step).cloned(),
            context: state.context.clone(),
        }
    }
}
