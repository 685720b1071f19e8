//! Shared types, errors, context, and snapshot model for the stepflow engine.
//!
//! This crate provides the vocabulary used across the stepflow crates:
//! - `FlowError`: unified error taxonomy
//! - `Context`: data shared by every step of a flow
//! - `FlowState`: the serializable snapshot the engine replaces on every change
//! - `RuntimeStatus` / `StepStatus`: explicit and resolved per-step status

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified error type for the stepflow engine.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // === Transition Errors ===
    #[error("Validation failed for step '{step}': {failure}")]
    Validation { step: String, failure: StepFailure },

    #[error("Exit guard denied leaving step '{step}'")]
    ExitDenied { step: String },

    #[error("Entry guard denied entering step '{step}'")]
    EntryDenied { step: String },

    #[error("No next step available from '{step}'")]
    NoNextStep { step: String },

    #[error("No history to go back to")]
    NoHistory,

    #[error("Transition already in progress")]
    TransitionInProgress,

    // === Configuration Errors ===
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Step graph is invalid: {0}")]
    InvalidGraph(String),

    // === Collaborator Errors ===
    #[error("{hook} hook failed on step '{step}': {message}")]
    Hook {
        step: String,
        hook: String,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Returns `true` for entry/exit guard denials.
    pub fn is_guard_denial(&self) -> bool {
        matches!(
            self,
            FlowError::ExitDenied { .. } | FlowError::EntryDenied { .. }
        )
    }

    /// Returns `true` when navigation ran out of places to go.
    pub fn is_navigation_exhausted(&self) -> bool {
        matches!(self, FlowError::NoNextStep { .. } | FlowError::NoHistory)
    }

    /// Returns `true` if the caller can fix its input or simply try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::Validation { .. }
                | FlowError::ExitDenied { .. }
                | FlowError::EntryDenied { .. }
                | FlowError::TransitionInProgress
        )
    }
}

/// A convenience alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// StepFailure: the error value recorded against a step
// ---------------------------------------------------------------------------

/// A validation failure or explicitly recorded step error.
///
/// Validators signal failure by returning one of these; the engine stores it
/// in `FlowState::errors` under the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attach structured details (field errors, codes, ...).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ---------------------------------------------------------------------------
// Context: data shared across all steps
// ---------------------------------------------------------------------------

/// Key-value data visible to every step.
///
/// `Context` is a plain owned value: cloning it yields a fully independent
/// copy, which is what keeps history entries valid after later updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: serde_json::Map<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Read a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Truthiness accessor: `false` when the key is absent or not a JSON bool.
    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow the underlying map.
    pub fn values(&self) -> &serde_json::Map<String, Value> {
        &self.values
    }
}

impl From<serde_json::Map<String, Value>> for Context {
    fn from(values: serde_json::Map<String, Value>) -> Self {
        Self { values }
    }
}

impl TryFrom<Value> for Context {
    type Error = FlowError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            Value::Null => Ok(Self::default()),
            other => Err(FlowError::Other(format!(
                "context must be a JSON object, got {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status model
// ---------------------------------------------------------------------------

/// Explicit, caller-driven status stamped onto a step.
///
/// These override whatever status would otherwise be computed for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Loading,
    /// Retryable failure.
    Error,
    /// Permanent failure.
    Terminated,
    Skipped,
}

/// The single resolved answer to "what state is this step logically in".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Current,
    Completed,
    Required,
    Optional,
    Unavailable,
    Loading,
    Error,
    Terminated,
    Skipped,
}

impl From<RuntimeStatus> for StepStatus {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Loading => StepStatus::Loading,
            RuntimeStatus::Error => StepStatus::Error,
            RuntimeStatus::Terminated => StepStatus::Terminated,
            RuntimeStatus::Skipped => StepStatus::Skipped,
        }
    }
}

/// Per-step runtime bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRuntime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RuntimeStatus>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// FlowState: the snapshot
// ---------------------------------------------------------------------------

/// Captured payloads keyed by step name.
pub type StepData = HashMap<String, Value>;

/// One prior position of the flow, kept for rewinding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub context: Context,
    pub data: StepData,
}

/// One complete capture of engine state.
///
/// The engine never mutates a published snapshot; every change produces a
/// new `FlowState` that replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub step: String,
    pub context: Context,
    #[serde(default)]
    pub data: StepData,
    #[serde(default)]
    pub errors: HashMap<String, StepFailure>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub is_loading: bool,
    #[serde(default)]
    pub is_transitioning: bool,
    #[serde(default)]
    pub runtime: HashMap<String, StepRuntime>,
}

impl FlowState {
    /// Fresh state: initial step and context, everything else empty.
    pub fn initial(step: impl Into<String>, context: Context) -> Self {
        Self {
            step: step.into(),
            context,
            data: StepData::new(),
            errors: HashMap::new(),
            history: Vec::new(),
            is_loading: false,
            is_transitioning: false,
            runtime: HashMap::new(),
        }
    }

    /// Payload captured for `step`, if any.
    pub fn step_data(&self, step: &str) -> Option<&Value> {
        self.data.get(step).filter(|v| !v.is_null())
    }

    /// Explicit runtime status of `step`, if one is set.
    pub fn runtime_status(&self, step: &str) -> Option<RuntimeStatus> {
        self.runtime.get(step).and_then(|r| r.status)
    }

    /// Capture the `{step, context, data}` triple for the history stack.
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            step: self.step.clone(),
            context: self.context.clone(),
            data: self.data.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Next,
    Back,
    Goto,
}

/// Payload handed to transition observers after a committed step change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub from: String,
    pub to: String,
    pub context: Context,
    pub data: StepData,
    pub kind: TransitionKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_display_validation() {
        let err = FlowError::Validation {
            step: "account".into(),
            failure: StepFailure::new("email is required"),
        };
        assert_eq!(
            err.to_string(),
            "Validation failed for step 'account': email is required"
        );
    }

    #[test]
    fn error_display_guards() {
        let exit = FlowError::ExitDenied {
            step: "billing".into(),
        };
        assert_eq!(exit.to_string(), "Exit guard denied leaving step 'billing'");

        let entry = FlowError::EntryDenied {
            step: "review".into(),
        };
        assert_eq!(entry.to_string(), "Entry guard denied entering step 'review'");
    }

    #[test]
    fn error_display_navigation() {
        let err = FlowError::NoNextStep {
            step: "done".into(),
        };
        assert_eq!(err.to_string(), "No next step available from 'done'");
        assert_eq!(FlowError::NoHistory.to_string(), "No history to go back to");
        assert_eq!(
            FlowError::TransitionInProgress.to_string(),
            "Transition already in progress"
        );
    }

    #[test]
    fn error_display_hook() {
        let err = FlowError::Hook {
            step: "profile".into(),
            hook: "load".into(),
            message: "backend unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "load hook failed on step 'profile': backend unavailable"
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(FlowError::EntryDenied { step: "a".into() }.is_guard_denial());
        assert!(!FlowError::NoHistory.is_guard_denial());

        assert!(FlowError::NoHistory.is_navigation_exhausted());
        assert!(FlowError::NoNextStep { step: "a".into() }.is_navigation_exhausted());

        assert!(FlowError::TransitionInProgress.is_recoverable());
        assert!(FlowError::Validation {
            step: "a".into(),
            failure: StepFailure::new("bad"),
        }
        .is_recoverable());
        assert!(!FlowError::UnknownStep("zzz".into()).is_recoverable());
        assert!(!FlowError::InvalidGraph("cycle".into()).is_recoverable());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<Value>("not json").unwrap_err();
        let err: FlowError = json_err.into();
        assert!(matches!(err, FlowError::Json(_)));
    }

    // --- StepFailure ---

    #[test]
    fn step_failure_details_skipped_when_null() {
        let plain = serde_json::to_value(StepFailure::new("nope")).unwrap();
        assert_eq!(plain, json!({"message": "nope"}));

        let detailed = StepFailure::new("nope").with_details(json!({"field": "email"}));
        let value = serde_json::to_value(&detailed).unwrap();
        assert_eq!(value["details"]["field"], "email");
    }

    // --- Context ---

    #[test]
    fn context_set_and_get() {
        let mut ctx = Context::new();
        ctx.set("plan", json!("pro"));
        assert_eq!(ctx.get("plan"), Some(&json!("pro")));
        assert_eq!(ctx.get_string("plan", "free"), "pro");
        assert_eq!(ctx.get_string("missing", "free"), "free");
    }

    #[test]
    fn context_get_bool_defaults_false() {
        let mut ctx = Context::new();
        assert!(!ctx.get_bool("verified"));
        ctx.set("verified", json!(true));
        assert!(ctx.get_bool("verified"));
        ctx.set("verified", json!("yes"));
        assert!(!ctx.get_bool("verified"));
    }

    #[test]
    fn context_clone_is_independent() {
        let mut ctx = Context::new();
        ctx.set("a", json!(1));
        let mut copy = ctx.clone();
        copy.set("a", json!(999));
        copy.set("b", json!(2));

        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert!(!ctx.contains_key("b"));
    }

    #[test]
    fn context_try_from_value() {
        let ctx = Context::try_from(json!({"x": 1})).unwrap();
        assert_eq!(ctx.len(), 1);
        assert!(Context::try_from(Value::Null).unwrap().is_empty());
        assert!(Context::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn context_serializes_as_plain_object() {
        let mut ctx = Context::new();
        ctx.set("k", json!("v"));
        assert_eq!(serde_json::to_string(&ctx).unwrap(), r#"{"k":"v"}"#);
    }

    // --- Status ---

    #[test]
    fn runtime_status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&RuntimeStatus::Terminated).unwrap(),
            "\"terminated\""
        );
        let status: RuntimeStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(status, RuntimeStatus::Skipped);
    }

    #[test]
    fn runtime_status_maps_onto_step_status() {
        assert_eq!(StepStatus::from(RuntimeStatus::Error), StepStatus::Error);
        assert_eq!(StepStatus::from(RuntimeStatus::Loading), StepStatus::Loading);
    }

    // --- FlowState ---

    #[test]
    fn initial_state_is_empty() {
        let state = FlowState::initial("welcome", Context::new());
        assert_eq!(state.step, "welcome");
        assert!(state.data.is_empty());
        assert!(state.errors.is_empty());
        assert!(state.history.is_empty());
        assert!(!state.is_loading);
        assert!(!state.is_transitioning);
    }

    #[test]
    fn step_data_treats_null_as_absent() {
        let mut state = FlowState::initial("a", Context::new());
        state.data.insert("a".into(), Value::Null);
        assert!(state.step_data("a").is_none());
        state.data.insert("a".into(), json!({"name": "John"}));
        assert_eq!(state.step_data("a").unwrap()["name"], "John");
    }

    #[test]
    fn history_entry_is_a_deep_copy() {
        let mut state = FlowState::initial("a", Context::new());
        state.context.set("n", json!(1));
        let entry = state.history_entry();
        state.context.set("n", json!(2));
        assert_eq!(entry.context.get("n"), Some(&json!(1)));
    }

    #[test]
    fn flow_state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = FlowState::initial("b", Context::new());
        state.data.insert("a".into(), json!({"x": 1}));
        state.runtime.insert(
            "b".into(),
            StepRuntime {
                status: Some(RuntimeStatus::Loading),
                attempts: 2,
                started_at: Some(Utc::now()),
                finished_at: None,
            },
        );

        std::fs::write(&path, serde_json::to_string_pretty(&state).unwrap()).unwrap();
        let loaded: FlowState =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn flow_state_fills_defaults_when_deserializing() {
        let state: FlowState =
            serde_json::from_value(json!({"step": "a", "context": {}})).unwrap();
        assert!(state.runtime.is_empty());
        assert!(!state.is_transitioning);
    }

    #[test]
    fn transition_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&TransitionKind::Goto).unwrap(),
            "\"goto\""
        );
    }
}
