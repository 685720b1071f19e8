//! Headless multi-step flow engine.
//!
//! This crate implements the stepflow state machine: a declarative graph of
//! steps with guards, validators, exit hooks and loaders, a snapshot store
//! replaced wholesale on every change, bounded history for rewinding,
//! caller-driven runtime status marks, and derived state (ordering,
//! availability, status, progress) computed over one committed snapshot.

pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod helpers;
pub mod history;
pub mod hooks;
pub mod lifecycle;
pub mod persistence;
pub mod retry;
pub mod runtime;
pub mod step;
pub mod store;
pub mod validation;

pub use config::{FlowConfig, HistoryConfig, PrerequisiteMap};
pub use context::{ContextManager, CurrentStep};
pub use engine::{Flow, FlowBuilder, TransitionObserver};
pub use events::{EventEmitter, EventSubscription, FlowEvent};
pub use helpers::ordering::{ordered_steps, topological_order};
pub use helpers::{GuardCache, HelperOptions, Helpers, Progress};
pub use history::HistoryManager;
pub use hooks::{ExitHook, Guard, GuardCheck, HookScope, StepLoader, StepValidator};
pub use lifecycle::StepLifecycle;
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use runtime::{StatusChange, StatusMarker, StatusObserver};
pub use step::{Attr, Candidates, NextSteps, StepDefinition, StepGraph, StepGraphBuilder};
pub use store::{Listener, Store, Subscription};
pub use validation::{validate, validate_or_raise, Diagnostic, FlowDefinition, LintRule, Severity};

pub use stepflow_types::{
    Context, FlowError, FlowState, HistoryEntry, Result, RuntimeStatus, StepData, StepFailure,
    StepRuntime, StepStatus, TransitionEvent, TransitionKind,
};
