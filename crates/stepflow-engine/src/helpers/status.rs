use indexmap::IndexMap;
use stepflow_types::StepStatus;

use super::Helpers;

impl Helpers<'_> {
    /// Resolved status of `step`, first match wins: current, explicit
    /// runtime mark, completed, unavailable, then required or optional.
    pub fn step_status(&self, step: &str) -> StepStatus {
        if step == self.state.step {
            return StepStatus::Current;
        }
        if let Some(marked) = self.state.runtime_status(step) {
            return marked.into();
        }
        if self.is_complete(step) {
            return StepStatus::Completed;
        }
        if !self.prerequisites_met(step) || !self.guard_allows(step) {
            return StepStatus::Unavailable;
        }
        if self.is_required(step) {
            StepStatus::Required
        } else {
            StepStatus::Optional
        }
    }

    /// Status of every step, in order.
    pub fn step_statuses(&self) -> IndexMap<String, StepStatus> {
        self.order()
            .iter()
            .map(|s| (s.clone(), self.step_status(s)))
            .collect()
    }
}
