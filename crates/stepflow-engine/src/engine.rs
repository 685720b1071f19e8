//! The flow engine: transition controller and public surface.
//!
//! A [`Flow`] owns one step graph and one store.  Transitions run their
//! suspension points (validator, exit guard, exit hook, entry guard, loader)
//! in sequence while `is_transitioning` is raised; a second transition
//! started in that window fails fast with
//! [`FlowError::TransitionInProgress`] instead of queueing.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use stepflow_types::{
    Context, FlowError, FlowState, HistoryEntry, Result, StepFailure, TransitionEvent,
    TransitionKind,
};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::FlowConfig;
use crate::context::{ContextManager, CurrentStep};
use crate::events::{EventEmitter, EventSubscription, FlowEvent};
use crate::helpers::{refresh_guards, GuardCache, HelperOptions, Helpers};
use crate::history::HistoryManager;
use crate::lifecycle::StepLifecycle;
use crate::persistence::Persistence;
use crate::runtime::{StatusChange, StatusMarker, StatusObserver};
use crate::step::StepGraph;
use crate::store::{lock, Store, Subscription};
use crate::validation::{validate_or_raise, FlowDefinition};

/// Called after every committed transition.  An error is logged and never
/// undoes the transition.
pub type TransitionObserver = Arc<dyn Fn(&TransitionEvent) -> Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct FlowBuilder {
    graph: StepGraph,
    initial_step: String,
    context: Context,
    config: FlowConfig,
    persistence: Option<Arc<dyn Persistence>>,
    on_transition: Option<TransitionObserver>,
    on_status_change: Option<StatusObserver>,
    helper_options: HelperOptions,
}

impl FlowBuilder {
    pub fn new(graph: StepGraph, initial_step: impl Into<String>) -> Self {
        Self {
            graph,
            initial_step: initial_step.into(),
            context: Context::new(),
            config: FlowConfig::default(),
            persistence: None,
            on_transition: None,
            on_status_change: None,
            helper_options: HelperOptions::default(),
        }
    }

    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn config(mut self, config: FlowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn on_transition(
        mut self,
        observer: impl Fn(&TransitionEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Arc::new(observer));
        self
    }

    pub fn on_status_change(
        mut self,
        observer: impl Fn(&StatusChange) + Send + Sync + 'static,
    ) -> Self {
        self.on_status_change = Some(Arc::new(observer));
        self
    }

    pub fn helper_options(mut self, options: HelperOptions) -> Self {
        self.helper_options = options;
        self
    }

    /// Validate the graph against the configuration, then create the flow.
    /// A persisted snapshot, if any, replaces the initial state.
    pub fn build(self) -> Result<Flow> {
        let diagnostics = validate_or_raise(&FlowDefinition {
            graph: &self.graph,
            config: &self.config,
            initial_step: &self.initial_step,
        })?;
        let id = Uuid::new_v4();
        for diag in &diagnostics {
            tracing::warn!(flow = %id, rule = %diag.rule, "{}", diag.message);
        }

        let graph = Arc::new(self.graph);
        let initial = FlowState::initial(self.initial_step, self.context);
        let store = match self.persistence {
            Some(persistence) => {
                let known = Arc::clone(&graph);
                Store::with_persistence(initial.clone(), persistence, move |saved| {
                    known.contains(&saved.step)
                        && saved.history.iter().all(|entry| known.contains(&entry.step))
                })
            }
            None => Store::new(initial.clone()),
        };

        let events = EventEmitter::new();
        let flow = Flow {
            id,
            contexts: ContextManager::new(store.clone()),
            history: HistoryManager::new(&self.config.history),
            lifecycle: StepLifecycle::new(Arc::clone(&graph), store.clone(), events.clone()),
            status: StatusMarker::new(store.clone(), events.clone(), self.on_status_change),
            guards: GuardCache::new(),
            pending_refresh: Mutex::new(None),
            on_transition: self.on_transition,
            options: self.helper_options,
            config: self.config,
            initial,
            events,
            store,
            graph,
        };
        tracing::info!(
            flow = %flow.id,
            step = %flow.store.get().step,
            steps = flow.graph.len(),
            "Flow created"
        );
        Ok(flow)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

pub struct Flow {
    id: Uuid,
    graph: Arc<StepGraph>,
    config: FlowConfig,
    initial: FlowState,
    store: Store,
    contexts: ContextManager,
    history: HistoryManager,
    lifecycle: StepLifecycle,
    status: StatusMarker,
    events: EventEmitter,
    options: HelperOptions,
    guards: GuardCache,
    on_transition: Option<TransitionObserver>,
    pending_refresh: Mutex<Option<PendingRefresh>>,
}

/// Clears `is_transitioning` on drop unless the transition committed.
///
/// Covers every early return as well as a dropped transition future.
struct TransitionGuard<'a> {
    store: &'a Store,
    committed: bool,
}

impl TransitionGuard<'_> {
    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.store.update(|state| state.is_transitioning = false);
        }
    }
}

struct PendingRefresh {
    deadline: Instant,
    done: watch::Receiver<bool>,
}

enum RefreshRole {
    Leader(watch::Sender<bool>),
    Follower(watch::Receiver<bool>),
}

/// Stamp an entry into `to`, leaving `from`.
fn stamp_entry(state: &mut FlowState, from: &str, to: &str) {
    let now = Utc::now();
    if from != to {
        state.runtime.entry(from.to_string()).or_default().finished_at = Some(now);
    }
    let runtime = state.runtime.entry(to.to_string()).or_default();
    runtime.attempts += 1;
    runtime.started_at = Some(now);
    state.step = to.to_string();
}

impl Flow {
    pub fn builder(graph: StepGraph, initial_step: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(graph, initial_step)
    }

    /// Instance id, recorded on every log line of this flow.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &StepLifecycle {
        &self.lifecycle
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    /// The last committed snapshot.
    pub fn state(&self) -> Arc<FlowState> {
        self.store.get()
    }

    // -- Transitions ---------------------------------------------------------

    fn begin(&self) -> Result<TransitionGuard<'_>> {
        self.store.try_update(|state| {
            if state.is_transitioning {
                return Err(FlowError::TransitionInProgress);
            }
            state.is_transitioning = true;
            Ok(())
        })?;
        Ok(TransitionGuard {
            store: &self.store,
            committed: false,
        })
    }

    /// Move to `target`, committing `data` for the current step first.
    ///
    /// Validation, exit guard, exit hook and entry guard run in that order;
    /// the first failure leaves `step` unchanged.  After the commit the
    /// target's loader runs and observers are notified.  A loader error is
    /// returned after notification; the transition stays committed.
    pub async fn transition_to(
        &self,
        target: &str,
        data: Option<Value>,
        kind: TransitionKind,
    ) -> Result<()> {
        let target_def = self.graph.require(target)?;
        let mut guard = self.begin()?;
        let from = self.store.get().step.clone();
        tracing::debug!(flow = %self.id, from = %from, to = target, ?kind, "Transition started");

        if let Some(data) = data {
            if let Err(failure) = self.lifecycle.validate_step_data(&from, &data).await {
                tracing::debug!(flow = %self.id, step = %from, error = %failure, "Validation failed");
                self.store.update(|state| {
                    state.errors.insert(from.clone(), failure.clone());
                });
                return Err(FlowError::Validation {
                    step: from,
                    failure,
                });
            }
            self.contexts.set_step_data(&from, data);
        }

        if !self.lifecycle.can_exit_current_step().await? {
            return Err(FlowError::ExitDenied { step: from });
        }

        self.lifecycle.execute_before_exit().await?;

        let allowed = self.lifecycle.can_enter_step(target).await?;
        if target_def.has_entry_guard() {
            self.guards.set(target, allowed);
        }
        if !allowed {
            return Err(FlowError::EntryDenied {
                step: target.to_string(),
            });
        }

        self.store.update(|state| {
            if kind != TransitionKind::Back {
                self.history.push(state);
            }
            state.is_transitioning = false;
            stamp_entry(state, &from, target);
        });
        guard.commit();

        let loaded = self.lifecycle.execute_load(target).await;
        self.publish_transition(from, target, kind);
        loaded
    }

    /// Advance to the first candidate of the current step's `next`.
    ///
    /// A computed `next` sees `data` when it is supplied, otherwise the
    /// stored payload.
    pub async fn next(&self, data: Option<Value>) -> Result<()> {
        let state = self.store.get();
        if state.is_transitioning {
            return Err(FlowError::TransitionInProgress);
        }
        let Some(target) = self.lifecycle.next_steps_with(data.as_ref()).into_iter().next() else {
            return Err(FlowError::NoNextStep {
                step: state.step.clone(),
            });
        };
        self.transition_to(&target, data, TransitionKind::Next).await
    }

    /// Jump to `step`, bypassing the declared `next` but not the guards.
    pub async fn go_to(&self, step: &str, data: Option<Value>) -> Result<()> {
        self.transition_to(step, data, TransitionKind::Goto).await
    }

    /// Restore the last history entry.  Guards are not consulted.
    pub async fn back(&self) -> Result<()> {
        let mut guard = self.begin()?;
        let from = self.store.get().step.clone();

        let restored = self.store.try_update(|state| {
            let entry = self.history.pop(state).ok_or(FlowError::NoHistory)?;
            state.context = entry.context;
            state.data = entry.data;
            state.is_transitioning = false;
            stamp_entry(state, &from, &entry.step);
            Ok(entry.step)
        })?;
        guard.commit();

        let loaded = self.lifecycle.execute_load(&restored).await;
        self.publish_transition(from, &restored, TransitionKind::Back);
        loaded
    }

    /// The position [`back`](Self::back) would return to.
    pub fn peek_history(&self) -> Option<HistoryEntry> {
        self.history.peek(&self.store.get()).cloned()
    }

    fn publish_transition(&self, from: String, to: &str, kind: TransitionKind) {
        let state = self.store.get();
        let event = TransitionEvent {
            from,
            to: to.to_string(),
            context: state.context.clone(),
            data: state.data.clone(),
            kind,
        };
        tracing::info!(flow = %self.id, from = %event.from, to = %event.to, ?kind, "Transition committed");
        if let Some(observer) = &self.on_transition {
            if let Err(e) = observer(&event) {
                tracing::warn!(flow = %self.id, error = %e, "Transition observer failed");
            }
        }
        self.events.emit(FlowEvent::Transitioned(event));
    }

    /// Return to the initial step and context, dropping data, errors,
    /// history, runtime marks and cached guard answers.  Persisted state is
    /// cleared.
    pub fn reset(&self) -> Result<()> {
        let initial = self.initial.clone();
        self.store.try_update(move |state| {
            if state.is_transitioning {
                return Err(FlowError::TransitionInProgress);
            }
            *state = initial;
            Ok(())
        })?;
        self.guards.clear();
        self.store.clear_persisted();
        tracing::info!(flow = %self.id, step = %self.initial.step, "Flow reset");
        self.events.emit(FlowEvent::Reset);
        Ok(())
    }

    // -- Context and data ----------------------------------------------------

    pub fn update_context(&self, mutator: impl FnOnce(&mut Context)) {
        self.contexts.update_context(mutator);
    }

    /// Replace `data[step]`, clearing any recorded error for it.
    pub fn set_step_data(&self, step: &str, value: Value) -> Result<()> {
        self.graph.require(step)?;
        self.contexts.set_step_data(step, value);
        Ok(())
    }

    pub fn context(&self) -> Context {
        self.contexts.context()
    }

    pub fn current(&self) -> CurrentStep {
        self.contexts.current()
    }

    pub fn step_data(&self, step: &str) -> Option<Value> {
        self.contexts.step_data(step)
    }

    // -- Subscriptions and events --------------------------------------------

    /// Called after every snapshot replacement.
    pub fn subscribe(&self, listener: impl Fn(&FlowState) + Send + Sync + 'static) -> Subscription {
        self.store.subscribe(listener)
    }

    pub fn emit(&self, event: FlowEvent) {
        self.events.emit(event);
    }

    pub fn subscribe_events(
        &self,
        listener: impl Fn(&FlowEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.events.subscribe(listener)
    }

    // -- Snapshots -----------------------------------------------------------

    pub fn snapshot(&self) -> FlowState {
        FlowState::clone(&self.store.get())
    }

    /// Replace the whole state with `snapshot`.
    ///
    /// Every step it names must exist.  Busy flags are cleared and history
    /// is trimmed to the configured size.
    pub fn restore(&self, mut snapshot: FlowState) -> Result<()> {
        self.graph.require(&snapshot.step)?;
        for entry in &snapshot.history {
            self.graph.require(&entry.step)?;
        }
        snapshot.is_loading = false;
        snapshot.is_transitioning = false;
        let overflow = snapshot
            .history
            .len()
            .saturating_sub(self.history.max_size());
        snapshot.history.drain(..overflow);

        self.store.try_update(move |state| {
            if state.is_transitioning {
                return Err(FlowError::TransitionInProgress);
            }
            *state = snapshot;
            Ok(())
        })?;
        self.guards.clear();
        tracing::info!(flow = %self.id, step = %self.store.get().step, "Flow restored");
        Ok(())
    }

    // -- Runtime status ------------------------------------------------------

    pub fn mark_error(&self, step: &str, error: Option<StepFailure>) -> Result<Option<StatusChange>> {
        self.graph.require(step)?;
        Ok(self.status.mark_error(step, error))
    }

    pub fn mark_terminated(
        &self,
        step: &str,
        error: Option<StepFailure>,
    ) -> Result<Option<StatusChange>> {
        self.graph.require(step)?;
        Ok(self.status.mark_terminated(step, error))
    }

    pub fn mark_loading(&self, step: &str) -> Result<Option<StatusChange>> {
        self.graph.require(step)?;
        Ok(self.status.mark_loading(step))
    }

    pub fn mark_idle(&self, step: &str) -> Result<Option<StatusChange>> {
        self.graph.require(step)?;
        Ok(self.status.mark_idle(step))
    }

    pub fn mark_skipped(&self, step: &str) -> Result<Option<StatusChange>> {
        self.graph.require(step)?;
        Ok(self.status.mark_skipped(step))
    }

    // -- Helpers -------------------------------------------------------------

    /// Query view over the current snapshot.
    pub fn helpers(&self) -> Helpers<'_> {
        Helpers::new(
            self.store.get(),
            &self.graph,
            &self.config,
            &self.options,
            &self.guards,
        )
    }

    /// Resolve every entry guard, deferred ones included, then notify store
    /// subscribers so they re-read availability.
    pub async fn refresh_availability(&self) {
        let state = self.store.get();
        refresh_guards(&self.graph, &state, &self.guards).await;
        tracing::debug!(flow = %self.id, "Availability sweep finished");
        self.store.notify();
    }

    /// Coalesce calls arriving within `refresh_debounce_ms` of each other
    /// into one trailing [`refresh_availability`](Self::refresh_availability).
    /// Every caller returns once that sweep has finished.  If the caller
    /// waiting out the window is dropped, a remaining caller takes its place.
    pub async fn refresh_availability_debounced(&self) {
        loop {
            match self.join_refresh() {
                RefreshRole::Follower(mut done) => {
                    if done.wait_for(|finished| *finished).await.is_ok() {
                        return;
                    }
                    // Leader dropped before sweeping; contend again.
                }
                RefreshRole::Leader(done) => {
                    self.lead_refresh().await;
                    let _ = done.send(true);
                    return;
                }
            }
        }
    }

    fn join_refresh(&self) -> RefreshRole {
        let mut slot = lock(&self.pending_refresh);
        let deadline = Instant::now() + self.config.refresh_debounce();
        match slot.as_mut() {
            // A closed channel means the previous leader was dropped.
            Some(pending) if pending.done.has_changed().is_ok() => {
                pending.deadline = deadline;
                RefreshRole::Follower(pending.done.clone())
            }
            _ => {
                let (tx, rx) = watch::channel(false);
                *slot = Some(PendingRefresh { deadline, done: rx });
                RefreshRole::Leader(tx)
            }
        }
    }

    /// Sleep until the window stops moving, then sweep.
    async fn lead_refresh(&self) {
        loop {
            let wait_until = {
                let mut slot = lock(&self.pending_refresh);
                match slot.as_ref().map(|p| p.deadline) {
                    Some(deadline) if deadline > Instant::now() => Some(deadline),
                    _ => {
                        *slot = None;
                        None
                    }
                }
            };
            match wait_until {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => break,
            }
        }
        self.refresh_availability().await;
    }
}
