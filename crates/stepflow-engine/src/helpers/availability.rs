//! Guard-aware availability.
//!
//! Synchronous queries never wait on a deferred entry guard.  A guard that
//! answers immediately is authoritative and its answer is cached; a guard
//! that defers is answered from the cache (default `false`) until
//! [`refresh_guards`] resolves it.

use std::collections::HashMap;
use std::sync::Mutex;

use stepflow_types::FlowState;

use super::Helpers;
use crate::step::StepGraph;
use crate::store::lock;

/// Last known answer of each step's entry guard.
#[derive(Debug, Default)]
pub struct GuardCache {
    entries: Mutex<HashMap<String, bool>>,
}

impl GuardCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step: &str) -> Option<bool> {
        lock(&self.entries).get(step).copied()
    }

    pub fn set(&self, step: &str, allowed: bool) {
        lock(&self.entries).insert(step.to_string(), allowed);
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

/// Resolve every entry guard against `state`, awaiting deferred ones, and
/// store the answers.  A guard that fails counts as denied.
pub(crate) async fn refresh_guards(graph: &StepGraph, state: &FlowState, cache: &GuardCache) {
    let mut resolved = 0usize;
    for (name, def) in graph.iter() {
        let Some(guard) = &def.entry_guard else {
            continue;
        };
        let check = guard.check(&state.context, state.step_data(name));
        let allowed = match check.resolve().await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(step = name, error = %e, "Entry guard failed during refresh");
                false
            }
        };
        cache.set(name, allowed);
        resolved += 1;
    }
    tracing::debug!(guards = resolved, "Availability refreshed");
}

impl Helpers<'_> {
    /// The entry guard's answer as far as it is known without waiting.
    pub(super) fn guard_allows(&self, step: &str) -> bool {
        let Some(def) = self.graph.get(step) else {
            return false;
        };
        let Some(guard) = &def.entry_guard else {
            return true;
        };
        match guard.check(&self.state.context, self.data(step)).ready() {
            Some(allowed) => {
                self.guards.set(step, allowed);
                allowed
            }
            None => self.guards.get(step).unwrap_or(false),
        }
    }

    /// Whether `step` could be entered right now.
    ///
    /// False when an earlier required step is unsatisfied, when a
    /// prerequisite is incomplete, or when the entry guard denies.
    pub fn can_enter_sync(&self, step: &str) -> bool {
        if !self.graph.contains(step) {
            return false;
        }
        let order = self.order();
        if let Some(index) = order.iter().position(|s| s == step) {
            let blocked = order[..index]
                .iter()
                .any(|earlier| self.is_required(earlier) && !self.is_satisfied(earlier));
            if blocked {
                return false;
            }
        }
        self.prerequisites_met(step) && self.guard_allows(step)
    }

    /// Prerequisites complete and entry guard not denying.  Unlike
    /// [`can_enter_sync`](Self::can_enter_sync), earlier steps in the order
    /// are not consulted.
    pub fn is_reachable(&self, step: &str) -> bool {
        self.graph.contains(step) && self.prerequisites_met(step) && self.guard_allows(step)
    }

    pub fn available_steps(&self) -> Vec<String> {
        self.filter_ordered(|s| self.can_enter_sync(s))
    }

    pub fn unavailable_steps(&self) -> Vec<String> {
        self.filter_ordered(|s| !self.can_enter_sync(s))
    }
}
