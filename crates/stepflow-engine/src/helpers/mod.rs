//! Derived state: read-only projections over the step graph and one
//! committed snapshot.
//!
//! A [`Helpers`] view is taken with [`Flow::helpers`](crate::engine::Flow::helpers)
//! and answers every query against the same snapshot, so a sequence of reads
//! is internally consistent even while a transition is in flight.
//!
//! Resolution rules:
//! - **required**: the step's `required` attribute, else
//!   [`HelperOptions::is_required`], else the inverse of
//!   [`HelperOptions::is_optional`], else `true`.
//! - **complete**: the step's `complete` attribute, else
//!   [`HelperOptions::is_complete`], else "a payload has been captured".
//! - **satisfied**: terminated or skipped, or complete while not marked
//!   `error` or `loading`.

mod availability;
mod navigation;
pub mod ordering;
mod progress;
mod status;

use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepflow_types::{Context, FlowState, RuntimeStatus};

use crate::config::{FlowConfig, PrerequisiteMap};
use crate::step::StepGraph;

pub use availability::GuardCache;
pub(crate) use availability::refresh_guards;
pub use progress::Progress;

type StepPredicate = Arc<dyn Fn(&str, &Context) -> Option<bool> + Send + Sync>;
type CompletionPredicate = Arc<dyn Fn(&str, &FlowState) -> Option<bool> + Send + Sync>;

/// Flow-wide fallbacks for steps that do not declare `required` or
/// `complete` themselves.  A predicate returning `None` defers to the next
/// rule.
#[derive(Clone, Default)]
pub struct HelperOptions {
    pub is_required: Option<StepPredicate>,
    pub is_optional: Option<StepPredicate>,
    pub is_complete: Option<CompletionPredicate>,
}

impl HelperOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required_by(
        mut self,
        f: impl Fn(&str, &Context) -> Option<bool> + Send + Sync + 'static,
    ) -> Self {
        self.is_required = Some(Arc::new(f));
        self
    }

    pub fn optional_by(
        mut self,
        f: impl Fn(&str, &Context) -> Option<bool> + Send + Sync + 'static,
    ) -> Self {
        self.is_optional = Some(Arc::new(f));
        self
    }

    pub fn complete_by(
        mut self,
        f: impl Fn(&str, &FlowState) -> Option<bool> + Send + Sync + 'static,
    ) -> Self {
        self.is_complete = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for HelperOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperOptions")
            .field("is_required", &self.is_required.is_some())
            .field("is_optional", &self.is_optional.is_some())
            .field("is_complete", &self.is_complete.is_some())
            .finish()
    }
}

/// Query view over one snapshot.
pub struct Helpers<'a> {
    state: Arc<FlowState>,
    graph: &'a StepGraph,
    config: &'a FlowConfig,
    options: &'a HelperOptions,
    guards: &'a GuardCache,
    order: OnceCell<Vec<String>>,
}

impl<'a> Helpers<'a> {
    pub fn new(
        state: Arc<FlowState>,
        graph: &'a StepGraph,
        config: &'a FlowConfig,
        options: &'a HelperOptions,
        guards: &'a GuardCache,
    ) -> Self {
        Self {
            state,
            graph,
            config,
            options,
            guards,
            order: OnceCell::new(),
        }
    }

    /// The snapshot every query of this view reads.
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    fn data(&self, step: &str) -> Option<&Value> {
        self.state.step_data(step)
    }

    // -- Ordering ------------------------------------------------------------

    fn order(&self) -> &[String] {
        self.order.get_or_init(|| {
            let declared = self.graph.declaration_order();
            let derived;
            let prerequisites = match &self.config.prerequisites {
                Some(map) => Some(map),
                None => {
                    derived = self.attribute_prerequisites();
                    derived.as_ref()
                }
            };
            ordering::ordered_steps(&declared, self.config.order.as_deref(), prerequisites)
        })
    }

    /// Prerequisite graph assembled from step attributes, if any step has one.
    fn attribute_prerequisites(&self) -> Option<PrerequisiteMap> {
        let map: PrerequisiteMap = self
            .graph
            .iter()
            .filter_map(|(name, def)| {
                let attr = def.prerequisites.as_ref()?;
                Some((name.to_string(), attr.resolve(&self.state.context, self.data(name))))
            })
            .collect();
        (!map.is_empty()).then_some(map)
    }

    /// Explicit order, else prerequisites sorted topologically, else
    /// declaration order.
    pub fn ordered_steps(&self) -> Vec<String> {
        self.order().to_vec()
    }

    pub fn step_index(&self, step: &str) -> Option<usize> {
        self.order().iter().position(|s| s == step)
    }

    // -- Meta-class ----------------------------------------------------------

    pub fn is_required(&self, step: &str) -> bool {
        let Some(def) = self.graph.get(step) else {
            return false;
        };
        if let Some(attr) = &def.required {
            return attr.resolve(&self.state.context, self.data(step));
        }
        if let Some(required) = self
            .options
            .is_required
            .as_ref()
            .and_then(|f| f(step, &self.state.context))
        {
            return required;
        }
        if let Some(optional) = self
            .options
            .is_optional
            .as_ref()
            .and_then(|f| f(step, &self.state.context))
        {
            return !optional;
        }
        true
    }

    pub fn is_optional(&self, step: &str) -> bool {
        self.graph.contains(step) && !self.is_required(step)
    }

    pub fn required_steps(&self) -> Vec<String> {
        self.filter_ordered(|s| self.is_required(s))
    }

    pub fn optional_steps(&self) -> Vec<String> {
        self.filter_ordered(|s| self.is_optional(s))
    }

    // -- Completion ----------------------------------------------------------

    pub fn is_complete(&self, step: &str) -> bool {
        let Some(def) = self.graph.get(step) else {
            return false;
        };
        if let Some(attr) = &def.complete {
            return attr.resolve(&self.state.context, self.data(step));
        }
        if let Some(complete) = self
            .options
            .is_complete
            .as_ref()
            .and_then(|f| f(step, &self.state))
        {
            return complete;
        }
        self.data(step).is_some()
    }

    pub fn is_satisfied(&self, step: &str) -> bool {
        match self.state.runtime_status(step) {
            Some(RuntimeStatus::Terminated | RuntimeStatus::Skipped) => true,
            Some(RuntimeStatus::Error | RuntimeStatus::Loading) => false,
            None => self.is_complete(step),
        }
    }

    pub fn completed_steps(&self) -> Vec<String> {
        self.filter_ordered(|s| self.is_complete(s))
    }

    /// Required steps not yet satisfied, in order.
    pub fn remaining_required(&self) -> Vec<String> {
        self.filter_ordered(|s| self.is_required(s) && !self.is_satisfied(s))
    }

    pub fn is_flow_complete(&self) -> bool {
        self.order()
            .iter()
            .all(|s| !self.is_required(s) || self.is_satisfied(s))
    }

    // -- Prerequisites -------------------------------------------------------

    /// The step's `prerequisites` attribute, else its entry in the configured
    /// prerequisite graph.
    pub fn prerequisites(&self, step: &str) -> Vec<String> {
        if let Some(attr) = self.graph.get(step).and_then(|def| def.prerequisites.as_ref()) {
            return attr.resolve(&self.state.context, self.data(step));
        }
        self.config
            .prerequisites
            .as_ref()
            .and_then(|map| map.get(step))
            .cloned()
            .unwrap_or_default()
    }

    pub fn prerequisites_met(&self, step: &str) -> bool {
        self.prerequisites(step).iter().all(|req| self.is_complete(req))
    }

    // -- Runtime diagnostics -------------------------------------------------

    /// Successful entries into `step`.
    pub fn step_attempts(&self, step: &str) -> u32 {
        self.state.runtime.get(step).map_or(0, |r| r.attempts)
    }

    /// Time between the last entry into `step` and leaving it.  `None` while
    /// the step has not been left since it was last entered.
    pub fn step_duration(&self, step: &str) -> Option<chrono::Duration> {
        let runtime = self.state.runtime.get(step)?;
        let (started, finished) = (runtime.started_at?, runtime.finished_at?);
        (finished >= started).then(|| finished - started)
    }

    /// `step` is marked `error` and its retry budget is not spent.
    pub fn can_retry(&self, step: &str) -> bool {
        if self.state.runtime_status(step) != Some(RuntimeStatus::Error) {
            return false;
        }
        self.graph
            .get(step)
            .and_then(|def| def.retry_policy())
            .is_some_and(|policy| policy.allows(self.step_attempts(step)))
    }

    /// How long an external retry loop should wait before re-entering `step`.
    pub fn retry_delay(&self, step: &str) -> Option<Duration> {
        if !self.can_retry(step) {
            return None;
        }
        self.graph
            .get(step)?
            .retry_policy()?
            .next_delay(self.step_attempts(step))
    }

    fn filter_ordered(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        self.order()
            .iter()
            .filter(|s| keep(s))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Owns everything a `Helpers` view borrows.
    pub(crate) struct Fixture {
        pub graph: StepGraph,
        pub config: FlowConfig,
        pub options: HelperOptions,
        pub guards: GuardCache,
        pub state: FlowState,
    }

    impl Fixture {
        pub fn new(graph: StepGraph, at: &str) -> Self {
            Self {
                graph,
                config: FlowConfig::default(),
                options: HelperOptions::default(),
                guards: GuardCache::default(),
                state: FlowState::initial(at, Context::new()),
            }
        }

        pub fn set_data(&mut self, step: &str, value: Value) {
            self.state.data.insert(step.to_string(), value);
        }

        pub fn mark(&mut self, step: &str, status: RuntimeStatus) {
            self.state.runtime.entry(step.to_string()).or_default().status = Some(status);
        }

        pub fn helpers(&self) -> Helpers<'_> {
            Helpers::new(
                Arc::new(self.state.clone()),
                &self.graph,
                &self.config,
                &self.options,
                &self.guards,
            )
        }
    }
}
