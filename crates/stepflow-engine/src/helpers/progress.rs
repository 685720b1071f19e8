//! Weighted completion arithmetic.

use indexmap::IndexMap;
use serde::Serialize;

use super::Helpers;

/// How much of the flow is done.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// Completed weight over total weight, in `[0, 1]`.
    pub ratio: f64,
    /// `round(ratio * 100)`.
    pub percent: u8,
    /// `"completed / total"` in unweighted step counts.
    pub label: String,
    pub completed: usize,
    pub total: usize,
}

impl Helpers<'_> {
    /// Weight of `step` toward progress; `1.0` unless the step declares one.
    /// Negative or non-finite weights count as zero.
    pub fn step_weight(&self, step: &str) -> f64 {
        let weight = self
            .graph
            .get(step)
            .and_then(|def| def.weight.as_ref())
            .map_or(1.0, |attr| attr.resolve(&self.state.context, self.data(step)));
        if weight.is_finite() && weight > 0.0 {
            weight
        } else {
            0.0
        }
    }

    pub fn progress(&self) -> Progress {
        let order = self.order();
        let mut total_weight = 0.0;
        let mut done_weight = 0.0;
        let mut completed = 0;
        for step in order {
            let weight = self.step_weight(step);
            total_weight += weight;
            if self.is_complete(step) {
                done_weight += weight;
                completed += 1;
            }
        }

        let ratio = if total_weight > 0.0 {
            (done_weight / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Progress {
            ratio,
            percent: (ratio * 100.0).round() as u8,
            label: format!("{completed} / {}", order.len()),
            completed,
            total: order.len(),
        }
    }

    /// `100` for each satisfied step, `0` otherwise.
    pub fn percent_complete_per_step(&self) -> IndexMap<String, u8> {
        self.order()
            .iter()
            .map(|s| (s.clone(), if self.is_satisfied(s) { 100 } else { 0 }))
            .collect()
    }
}
