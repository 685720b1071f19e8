//! Navigation queries over the ordered step list.
//!
//! `from` defaults to the current step.  A position outside the ordered list
//! scans forward from the start and has nothing before it.

use super::Helpers;

impl Helpers<'_> {
    fn position(&self, from: Option<&str>) -> Option<usize> {
        self.step_index(from.unwrap_or(self.state.step.as_str()))
    }

    /// First step after `from` that [`can_enter_sync`](Self::can_enter_sync).
    pub fn find_next_available(&self, from: Option<&str>) -> Option<String> {
        let start = self.position(from).map_or(0, |i| i + 1);
        self.order()
            .get(start..)?
            .iter()
            .find(|s| self.can_enter_sync(s))
            .cloned()
    }

    /// Closest step before `from` that can be entered.
    pub fn find_prev_available(&self, from: Option<&str>) -> Option<String> {
        let end = self.position(from)?;
        self.order()[..end]
            .iter()
            .rev()
            .find(|s| self.can_enter_sync(s))
            .cloned()
    }

    /// Like [`find_next_available`](Self::find_next_available), limited to
    /// required steps.
    pub fn jump_to_next_required(&self, from: Option<&str>) -> Option<String> {
        let start = self.position(from).map_or(0, |i| i + 1);
        self.order()
            .get(start..)?
            .iter()
            .find(|s| self.is_required(s) && self.can_enter_sync(s))
            .cloned()
    }

    pub fn first_incomplete_step(&self) -> Option<String> {
        self.order()
            .iter()
            .find(|s| !self.is_satisfied(s))
            .cloned()
    }

    /// Last satisfied step at or before the current one.
    pub fn last_completed_step(&self) -> Option<String> {
        let end = self.position(None).map_or(self.order().len(), |i| i + 1);
        self.order()[..end]
            .iter()
            .rev()
            .find(|s| self.is_satisfied(s))
            .cloned()
    }

    /// History holds an entry and no transition is in flight.
    pub fn can_go_back(&self) -> bool {
        !self.state.is_transitioning && !self.state.history.is_empty()
    }

    /// The current step resolves at least one next candidate and no
    /// transition is in flight.
    pub fn can_go_next(&self) -> bool {
        if self.state.is_transitioning {
            return false;
        }
        self.graph.get(&self.state.step).is_some_and(|def| {
            !def.next_steps()
                .resolve(&self.state.context, self.data(&self.state.step))
                .is_empty()
        })
    }
}
