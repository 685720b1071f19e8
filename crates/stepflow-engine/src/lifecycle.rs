//! Step lifecycle: validation, guards, exit hooks, loaders and next-step
//! resolution for individual steps.
//!
//! Every operation here reads the last committed snapshot.  Sequencing the
//! calls into a transition is the job of [`Flow`](crate::engine::Flow).

use std::sync::Arc;

use serde_json::Value;
use stepflow_types::{Result, StepFailure};

use crate::context::ContextManager;
use crate::events::EventEmitter;
use crate::hooks::HookScope;
use crate::step::StepGraph;
use crate::store::Store;

#[derive(Clone)]
pub struct StepLifecycle {
    graph: Arc<StepGraph>,
    store: Store,
    contexts: ContextManager,
    events: EventEmitter,
}

impl StepLifecycle {
    pub fn new(graph: Arc<StepGraph>, store: Store, events: EventEmitter) -> Self {
        Self {
            graph,
            contexts: ContextManager::new(store.clone()),
            store,
            events,
        }
    }

    fn scope(&self, step: &str) -> HookScope {
        HookScope::new(step, self.contexts.clone(), self.events.clone())
    }

    /// Run `step`'s validator on `data`.  A step without one accepts anything.
    pub async fn validate_step_data(
        &self,
        step: &str,
        data: &Value,
    ) -> std::result::Result<(), StepFailure> {
        let Some(validator) = self.graph.get(step).and_then(|def| def.validator.clone()) else {
            return Ok(());
        };
        let context = self.contexts.context();
        validator.validate(data, &context).await
    }

    /// Evaluate `step`'s entry guard against the current context and the
    /// payload already captured for `step`.
    pub async fn can_enter_step(&self, step: &str) -> Result<bool> {
        let def = self.graph.require(step)?;
        let Some(guard) = &def.entry_guard else {
            return Ok(true);
        };
        let check = {
            let state = self.store.get();
            guard.check(&state.context, state.step_data(step))
        };
        check.resolve().await
    }

    /// Evaluate the current step's exit guard against `(context, data[current])`.
    pub async fn can_exit_current_step(&self) -> Result<bool> {
        let state = self.store.get();
        let def = self.graph.require(&state.step)?;
        let Some(guard) = &def.exit_guard else {
            return Ok(true);
        };
        let check = guard.check(&state.context, state.step_data(&state.step));
        check.resolve().await
    }

    /// Run the current step's exit hook, if it has one.
    pub async fn execute_before_exit(&self) -> Result<()> {
        let step = self.store.get().step.clone();
        let Some(hook) = self.graph.require(&step)?.before_exit.clone() else {
            return Ok(());
        };
        tracing::debug!(step = %step, "Running exit hook");
        hook.before_exit(self.scope(&step)).await
    }

    /// Run `step`'s loader with `is_loading` raised.  The flag is lowered
    /// again whatever the loader returns.
    pub async fn execute_load(&self, step: &str) -> Result<()> {
        let Some(loader) = self.graph.require(step)?.loader.clone() else {
            return Ok(());
        };
        tracing::debug!(step, "Loading step");
        self.store.update(|state| state.is_loading = true);
        let _loading = LoadingFlag(&self.store);
        loader.load(self.scope(step)).await
    }

    /// Candidates for the current step's `next`, resolved against its stored
    /// payload.  Empty means the step is terminal.
    pub fn next_steps(&self) -> Vec<String> {
        self.next_steps_with(None)
    }

    /// Like [`next_steps`](Self::next_steps), resolving a computed `next`
    /// against `data` instead of the stored payload when it is given.
    pub fn next_steps_with(&self, data: Option<&Value>) -> Vec<String> {
        let state = self.store.get();
        let Some(def) = self.graph.get(&state.step) else {
            return Vec::new();
        };
        let data = data.or_else(|| state.step_data(&state.step));
        def.next_steps().resolve(&state.context, data)
    }
}

/// Lowers `is_loading` on drop, including when the loader future is cancelled.
struct LoadingFlag<'a>(&'a Store);

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.update(|state| state.is_loading = false);
    }
}
