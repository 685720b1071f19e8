use std::fmt;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use stepflow_types::{Context, FlowError, Result, StepFailure};

use crate::hooks::{
    ExitHook, FnGuard, FnHook, FnValidator, Guard, GuardCheck, HookScope, StepLoader, StepValidator,
};
use crate::retry::{BackoffPolicy, RetryPolicy};

type AttrFn<T> = Arc<dyn Fn(&Context, Option<&Value>) -> T + Send + Sync>;

/// A step attribute: a literal, or a function of `(context, step data)`.
#[derive(Clone)]
pub enum Attr<T> {
    Value(T),
    Computed(AttrFn<T>),
}

impl<T: Clone> Attr<T> {
    pub fn computed(f: impl Fn(&Context, Option<&Value>) -> T + Send + Sync + 'static) -> Self {
        Attr::Computed(Arc::new(f))
    }

    pub fn resolve(&self, context: &Context, data: Option<&Value>) -> T {
        match self {
            Attr::Value(v) => v.clone(),
            Attr::Computed(f) => f(context, data),
        }
    }

    /// The literal value, when the attribute does not depend on state.
    pub fn literal(&self) -> Option<&T> {
        match self {
            Attr::Value(v) => Some(v),
            Attr::Computed(_) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Attr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Attr::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Next-step resolution
// ---------------------------------------------------------------------------

/// One or more candidate step names, normalized to a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates(Vec<String>);

impl Candidates {
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for Candidates {
    fn from(step: &str) -> Self {
        Candidates(vec![step.to_string()])
    }
}

impl From<String> for Candidates {
    fn from(step: String) -> Self {
        Candidates(vec![step])
    }
}

impl From<Option<&str>> for Candidates {
    fn from(step: Option<&str>) -> Self {
        Candidates(step.map(String::from).into_iter().collect())
    }
}

impl From<Option<String>> for Candidates {
    fn from(step: Option<String>) -> Self {
        Candidates(step.into_iter().collect())
    }
}

impl From<Vec<String>> for Candidates {
    fn from(steps: Vec<String>) -> Self {
        Candidates(steps)
    }
}

impl From<Vec<&str>> for Candidates {
    fn from(steps: Vec<&str>) -> Self {
        Candidates(steps.into_iter().map(String::from).collect())
    }
}

type NextFn = Arc<dyn Fn(&Context, Option<&Value>) -> Vec<String> + Send + Sync>;

/// Where a step may go next.
#[derive(Clone)]
pub enum NextSteps {
    Static(Vec<String>),
    Computed(NextFn),
}

impl NextSteps {
    /// Concrete candidates; an empty list means the step is terminal.
    pub fn resolve(&self, context: &Context, data: Option<&Value>) -> Vec<String> {
        match self {
            NextSteps::Static(steps) => steps.clone(),
            NextSteps::Computed(f) => f(context, data),
        }
    }

    pub fn static_targets(&self) -> Option<&[String]> {
        match self {
            NextSteps::Static(steps) => Some(steps),
            NextSteps::Computed(_) => None,
        }
    }
}

impl Default for NextSteps {
    fn default() -> Self {
        NextSteps::Static(Vec::new())
    }
}

impl fmt::Debug for NextSteps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextSteps::Static(steps) => f.debug_tuple("Static").field(steps).finish(),
            NextSteps::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// Behavior and attributes of one step.
///
/// Built fluently; every part is optional.  A bare `StepDefinition::new()` is
/// a terminal step with no guards that is always valid, required, and complete
/// once it has data.
#[derive(Clone, Default)]
pub struct StepDefinition {
    pub(crate) next: NextSteps,
    pub(crate) validator: Option<Arc<dyn StepValidator>>,
    pub(crate) entry_guard: Option<Arc<dyn Guard>>,
    pub(crate) exit_guard: Option<Arc<dyn Guard>>,
    pub(crate) before_exit: Option<Arc<dyn ExitHook>>,
    pub(crate) loader: Option<Arc<dyn StepLoader>>,
    pub(crate) required: Option<Attr<bool>>,
    pub(crate) complete: Option<Attr<bool>>,
    pub(crate) weight: Option<Attr<f64>>,
    pub(crate) prerequisites: Option<Attr<Vec<String>>>,
    pub(crate) retry: Option<RetryPolicy>,
    label: Option<String>,
    description: Option<String>,
}

impl StepDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next = NextSteps::Static(targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn next_when<F, C>(mut self, f: F) -> Self
    where
        F: Fn(&Context, Option<&Value>) -> C + Send + Sync + 'static,
        C: Into<Candidates>,
    {
        self.next = NextSteps::Computed(Arc::new(move |ctx, data| f(ctx, data).into().into_vec()));
        self
    }

    pub fn validate_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &Context) -> std::result::Result<(), StepFailure> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(FnValidator(f)));
        self
    }

    pub fn validator(mut self, validator: impl StepValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn can_enter<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Context, Option<&Value>) -> R + Send + Sync + 'static,
        R: Into<GuardCheck> + 'static,
    {
        self.entry_guard = Some(Arc::new(FnGuard::new(f)));
        self
    }

    pub fn can_exit<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Context, Option<&Value>) -> R + Send + Sync + 'static,
        R: Into<GuardCheck> + 'static,
    {
        self.exit_guard = Some(Arc::new(FnGuard::new(f)));
        self
    }

    pub fn entry_guard(mut self, guard: impl Guard + 'static) -> Self {
        self.entry_guard = Some(Arc::new(guard));
        self
    }

    pub fn exit_guard(mut self, guard: impl Guard + 'static) -> Self {
        self.exit_guard = Some(Arc::new(guard));
        self
    }

    pub fn before_exit_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_exit = Some(Arc::new(FnHook(f)));
        self
    }

    pub fn before_exit(mut self, hook: impl ExitHook + 'static) -> Self {
        self.before_exit = Some(Arc::new(hook));
        self
    }

    pub fn load_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.loader = Some(Arc::new(FnHook(f)));
        self
    }

    pub fn loader(mut self, loader: impl StepLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(Attr::Value(required));
        self
    }

    pub fn required_when(
        mut self,
        f: impl Fn(&Context, Option<&Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.required = Some(Attr::computed(f));
        self
    }

    pub fn complete(mut self, complete: bool) -> Self {
        self.complete = Some(Attr::Value(complete));
        self
    }

    pub fn complete_when(
        mut self,
        f: impl Fn(&Context, Option<&Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Attr::computed(f));
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(Attr::Value(weight));
        self
    }

    pub fn weight_when(
        mut self,
        f: impl Fn(&Context, Option<&Value>) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.weight = Some(Attr::computed(f));
        self
    }

    pub fn prerequisites<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = Some(Attr::Value(steps.into_iter().map(Into::into).collect()));
        self
    }

    pub fn prerequisites_when(
        mut self,
        f: impl Fn(&Context, Option<&Value>) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.prerequisites = Some(Attr::computed(f));
        self
    }

    /// Declarative only: consulted by external retry loops, never by the engine.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        let backoff = self.retry.take().map(|r| r.backoff).unwrap_or_default();
        self.retry = Some(RetryPolicy {
            max_retries,
            backoff,
        });
        self
    }

    pub fn retry_backoff(mut self, backoff: BackoffPolicy) -> Self {
        let max_retries = self.retry.take().map(|r| r.max_retries).unwrap_or(0);
        self.retry = Some(RetryPolicy {
            max_retries,
            backoff,
        });
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn next_steps(&self) -> &NextSteps {
        &self.next
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn has_entry_guard(&self) -> bool {
        self.entry_guard.is_some()
    }

    /// Prerequisites named literally, without evaluating computed ones.
    pub fn static_prerequisites(&self) -> Option<&[String]> {
        self.prerequisites
            .as_ref()
            .and_then(Attr::literal)
            .map(Vec::as_slice)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("next", &self.next)
            .field("validator", &self.validator.is_some())
            .field("entry_guard", &self.entry_guard.is_some())
            .field("exit_guard", &self.exit_guard.is_some())
            .field("before_exit", &self.before_exit.is_some())
            .field("loader", &self.loader.is_some())
            .field("required", &self.required)
            .field("complete", &self.complete)
            .field("weight", &self.weight)
            .field("prerequisites", &self.prerequisites)
            .field("retry", &self.retry)
            .field("label", &self.label)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// Immutable mapping from step name to definition, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    steps: IndexMap<String, StepDefinition>,
}

impl StepGraph {
    pub fn builder() -> StepGraphBuilder {
        StepGraphBuilder::default()
    }

    /// A straight line: each step's `next` is the one declared after it.
    pub fn linear<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut builder = Self::builder();
        for (i, name) in names.iter().enumerate() {
            let def = match names.get(i + 1) {
                Some(next) => StepDefinition::new().next([next.clone()]),
                None => StepDefinition::new(),
            };
            builder = builder.step(name.clone(), def);
        }
        builder.build()
    }

    pub fn get(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }

    /// Like [`get`](Self::get), failing with `UnknownStep`.
    pub fn require(&self, name: &str) -> Result<&StepDefinition> {
        self.steps
            .get(name)
            .ok_or_else(|| FlowError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub fn declaration_order(&self) -> Vec<String> {
        self.steps.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepDefinition)> {
        self.steps.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Default)]
pub struct StepGraphBuilder {
    steps: IndexMap<String, StepDefinition>,
    duplicates: Vec<String>,
}

impl StepGraphBuilder {
    pub fn step(mut self, name: impl Into<String>, definition: StepDefinition) -> Self {
        let name = name.into();
        if self.steps.contains_key(&name) {
            self.duplicates.push(name);
        } else {
            self.steps.insert(name, definition);
        }
        self
    }

    pub fn build(self) -> Result<StepGraph> {
        if !self.duplicates.is_empty() {
            return Err(FlowError::InvalidGraph(format!(
                "duplicate step names: {}",
                self.duplicates.join(", ")
            )));
        }
        Ok(StepGraph { steps: self.steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attr_resolves_literal_and_computed() {
        let ctx = Context::new();
        assert!(Attr::Value(true).resolve(&ctx, None));

        let weight = Attr::computed(|_, data: Option<&Value>| {
            data.and_then(|d| d["items"].as_f64()).unwrap_or(1.0)
        });
        assert_eq!(weight.resolve(&ctx, None), 1.0);
        assert_eq!(weight.resolve(&ctx, Some(&json!({"items": 4.0}))), 4.0);
        assert!(weight.literal().is_none());
    }

    #[test]
    fn candidates_normalize_single_and_optional() {
        assert_eq!(Candidates::from("a").into_vec(), vec!["a"]);
        assert!(Candidates::from(None::<String>).into_vec().is_empty());
        assert_eq!(Candidates::from(vec!["a", "b"]).into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn computed_next_sees_context_and_data() {
        let def = StepDefinition::new().next_when(|ctx, data| {
            if ctx.get_bool("express") || data.is_some_and(|d| d["skip"] == json!(true)) {
                "review"
            } else {
                "details"
            }
        });
        let mut ctx = Context::new();
        assert_eq!(def.next_steps().resolve(&ctx, None), vec!["details"]);
        assert_eq!(
            def.next_steps().resolve(&ctx, Some(&json!({"skip": true}))),
            vec!["review"]
        );
        ctx.set("express", json!(true));
        assert_eq!(def.next_steps().resolve(&ctx, None), vec!["review"]);
        assert!(def.next_steps().static_targets().is_none());
    }

    #[test]
    fn retry_builders_compose_in_any_order() {
        let a = StepDefinition::new()
            .max_retries(3)
            .retry_backoff(BackoffPolicy::None);
        let b = StepDefinition::new()
            .retry_backoff(BackoffPolicy::None)
            .max_retries(3);
        assert_eq!(a.retry_policy(), b.retry_policy());
        assert_eq!(a.retry_policy().unwrap().max_retries, 3);
    }

    #[test]
    fn graph_keeps_declaration_order() {
        let graph = StepGraph::builder()
            .step("c", StepDefinition::new())
            .step("a", StepDefinition::new())
            .step("b", StepDefinition::new())
            .build()
            .unwrap();
        assert_eq!(graph.declaration_order(), vec!["c", "a", "b"]);
        assert!(graph.contains("a"));
        assert!(graph.require("zzz").is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = StepGraph::builder()
            .step("a", StepDefinition::new())
            .step("a", StepDefinition::new())
            .build();
        assert!(matches!(result, Err(FlowError::InvalidGraph(msg)) if msg.contains("a")));
    }

    #[test]
    fn linear_graph_chains_steps() {
        let graph = StepGraph::linear(["one", "two", "three"]).unwrap();
        let ctx = Context::new();
        assert_eq!(graph.get("one").unwrap().next_steps().resolve(&ctx, None), vec!["two"]);
        assert!(graph
            .get("three")
            .unwrap()
            .next_steps()
            .resolve(&ctx, None)
            .is_empty());
    }

    #[test]
    fn metadata_accessors() {
        let def = StepDefinition::new()
            .with_label("Billing")
            .with_description("Payment details")
            .prerequisites(["account"]);
        assert_eq!(def.label(), Some("Billing"));
        assert_eq!(def.description(), Some("Payment details"));
        assert_eq!(def.static_prerequisites(), Some(&["account".to_string()][..]));
        assert!(def.validator.is_none());
    }
}
