//! Per-step collaborators: guards, validators, exit hooks and loaders.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use stepflow_types::{Context, Result, StepFailure};

use crate::context::ContextManager;
use crate::events::{EventEmitter, FlowEvent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Result of evaluating a guard: known now, or known later.
pub enum GuardCheck {
    Ready(bool),
    Deferred(BoxFuture<'static, Result<bool>>),
}

impl GuardCheck {
    pub fn deferred(future: impl Future<Output = Result<bool>> + Send + 'static) -> Self {
        GuardCheck::Deferred(Box::pin(future))
    }

    /// The answer, if it is available without waiting.
    pub fn ready(&self) -> Option<bool> {
        match self {
            GuardCheck::Ready(allowed) => Some(*allowed),
            GuardCheck::Deferred(_) => None,
        }
    }

    pub async fn resolve(self) -> Result<bool> {
        match self {
            GuardCheck::Ready(allowed) => Ok(allowed),
            GuardCheck::Deferred(future) => future.await,
        }
    }
}

impl From<bool> for GuardCheck {
    fn from(allowed: bool) -> Self {
        GuardCheck::Ready(allowed)
    }
}

/// Entry or exit predicate for a step.
pub trait Guard: Send + Sync {
    /// `data` is the payload captured for the guarded step, if any.
    fn check(&self, context: &Context, data: Option<&Value>) -> GuardCheck;
}

pub(crate) struct FnGuard<F, R> {
    f: F,
    _returns: PhantomData<fn() -> R>,
}

impl<F, R> FnGuard<F, R> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _returns: PhantomData,
        }
    }
}

impl<F, R> Guard for FnGuard<F, R>
where
    F: Fn(&Context, Option<&Value>) -> R + Send + Sync,
    R: Into<GuardCheck>,
{
    fn check(&self, context: &Context, data: Option<&Value>) -> GuardCheck {
        (self.f)(context, data).into()
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Inspects a raw payload before it is committed for a step.
#[async_trait]
pub trait StepValidator: Send + Sync {
    async fn validate(&self, data: &Value, context: &Context) -> std::result::Result<(), StepFailure>;
}

pub(crate) struct FnValidator<F>(pub(crate) F);

#[async_trait]
impl<F> StepValidator for FnValidator<F>
where
    F: Fn(&Value, &Context) -> std::result::Result<(), StepFailure> + Send + Sync,
{
    async fn validate(&self, data: &Value, context: &Context) -> std::result::Result<(), StepFailure> {
        (self.0)(data, context)
    }
}

// ---------------------------------------------------------------------------
// Exit hooks and loaders
// ---------------------------------------------------------------------------

/// Side effects to run when leaving a step. Does not pick the destination.
#[async_trait]
pub trait ExitHook: Send + Sync {
    async fn before_exit(&self, scope: HookScope) -> Result<()>;
}

/// Async data loader run after a step is entered.
#[async_trait]
pub trait StepLoader: Send + Sync {
    async fn load(&self, scope: HookScope) -> Result<()>;
}

pub(crate) struct FnHook<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> ExitHook for FnHook<F>
where
    F: Fn(HookScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn before_exit(&self, scope: HookScope) -> Result<()> {
        (self.0)(scope).await
    }
}

#[async_trait]
impl<F, Fut> StepLoader for FnHook<F>
where
    F: Fn(HookScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn load(&self, scope: HookScope) -> Result<()> {
        (self.0)(scope).await
    }
}

/// What an exit hook or loader may touch: the live context, step data, and
/// the flow's event bus.
#[derive(Clone)]
pub struct HookScope {
    step: String,
    contexts: ContextManager,
    events: EventEmitter,
}

impl HookScope {
    pub(crate) fn new(step: impl Into<String>, contexts: ContextManager, events: EventEmitter) -> Self {
        Self {
            step: step.into(),
            contexts,
            events,
        }
    }

    /// The step this hook runs for.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn context(&self) -> Context {
        self.contexts.context()
    }

    /// Payload currently captured for this hook's step.
    pub fn data(&self) -> Option<Value> {
        self.contexts.step_data(&self.step)
    }

    pub fn update_context(&self, mutator: impl FnOnce(&mut Context)) {
        self.contexts.update_context(mutator);
    }

    /// Replace this hook's own step payload.
    pub fn set_data(&self, value: Value) {
        self.contexts.set_step_data(&self.step, value);
    }

    pub fn set_step_data(&self, step: &str, value: Value) {
        self.contexts.set_step_data(step, value);
    }

    pub fn emit(&self, event: FlowEvent) {
        self.events.emit(event);
    }
}
