//! Bounded stack of prior `{step, context, data}` positions.

use stepflow_types::{FlowState, HistoryEntry};

use crate::config::HistoryConfig;

#[derive(Debug, Clone)]
pub struct HistoryManager {
    enabled: bool,
    max_size: usize,
}

impl HistoryManager {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_size: config.max_size,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.max_size > 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Append a copy of the current position to `state.history`, evicting the
    /// oldest entries once the cap is exceeded.  Runs inside the caller's
    /// commit.
    pub fn push(&self, state: &mut FlowState) {
        if !self.is_enabled() {
            return;
        }
        let entry = state.history_entry();
        state.history.push(entry);
        let overflow = state.history.len().saturating_sub(self.max_size);
        if overflow > 0 {
            state.history.drain(..overflow);
        }
    }

    pub fn peek<'a>(&self, state: &'a FlowState) -> Option<&'a HistoryEntry> {
        if !self.is_enabled() {
            return None;
        }
        state.history.last()
    }

    /// Remove and return the newest entry.
    pub fn pop(&self, state: &mut FlowState) -> Option<HistoryEntry> {
        if !self.is_enabled() {
            return None;
        }
        state.history.pop()
    }
}
