//! Flow validation: lint rules and diagnostics.
//!
//! Checks that a [`StepGraph`] and its [`FlowConfig`] agree on step names and
//! that the prerequisite graph can be ordered.  Call [`validate`] for all
//! diagnostics or [`validate_or_raise`] to fail on the first `Error`.

use std::collections::HashSet;

use stepflow_types::{FlowError, Result};

use crate::config::{FlowConfig, PrerequisiteMap};
use crate::helpers::ordering::topological_order;
use crate::step::StepGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Everything a rule may inspect.
pub struct FlowDefinition<'a> {
    pub graph: &'a StepGraph,
    pub config: &'a FlowConfig,
    pub initial_step: &'a str,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic>;
}

fn error(rule: &str, message: String, step: Option<&str>) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        step: step.map(String::from),
    }
}

/// Static prerequisites from step attributes, or the config graph.
fn static_prerequisite_map(flow: &FlowDefinition<'_>) -> PrerequisiteMap {
    if let Some(map) = &flow.config.prerequisites {
        return map.clone();
    }
    flow.graph
        .iter()
        .filter_map(|(name, def)| {
            def.static_prerequisites()
                .map(|reqs| (name.to_string(), reqs.to_vec()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyRule;
impl LintRule for NonEmptyRule {
    fn name(&self) -> &str { "non_empty" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        if flow.graph.is_empty() {
            vec![error(self.name(), "Flow has no steps".into(), None)]
        } else {
            vec![]
        }
    }
}

struct InitialStepRule;
impl LintRule for InitialStepRule {
    fn name(&self) -> &str { "initial_step" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        if flow.graph.is_empty() || flow.graph.contains(flow.initial_step) {
            return vec![];
        }
        vec![error(
            self.name(),
            format!("Initial step '{}' is not defined", flow.initial_step),
            Some(flow.initial_step),
        )]
    }
}

struct NextTargetsRule;
impl LintRule for NextTargetsRule {
    fn name(&self) -> &str { "next_targets" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (name, def) in flow.graph.iter() {
            let Some(targets) = def.next_steps().static_targets() else {
                continue;
            };
            for target in targets.iter().filter(|t| !flow.graph.contains(t)) {
                diags.push(error(
                    self.name(),
                    format!("Step '{name}' lists unknown next step '{target}'"),
                    Some(name),
                ));
            }
        }
        diags
    }
}

struct PrerequisiteRefsRule;
impl LintRule for PrerequisiteRefsRule {
    fn name(&self) -> &str { "prerequisite_refs" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut check = |owner: &str, reqs: &[String]| {
            if !flow.graph.contains(owner) {
                diags.push(error(
                    self.name(),
                    format!("Prerequisites declared for unknown step '{owner}'"),
                    Some(owner),
                ));
            }
            for req in reqs.iter().filter(|r| !flow.graph.contains(r)) {
                diags.push(error(
                    self.name(),
                    format!("Step '{owner}' requires unknown step '{req}'"),
                    Some(owner),
                ));
            }
        };
        for (name, def) in flow.graph.iter() {
            if let Some(reqs) = def.static_prerequisites() {
                check(name, reqs);
            }
        }
        if let Some(map) = &flow.config.prerequisites {
            for (name, reqs) in map {
                check(name.as_str(), reqs.as_slice());
            }
        }
        diags
    }
}

struct OrderRefsRule;
impl LintRule for OrderRefsRule {
    fn name(&self) -> &str { "order_refs" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        let Some(order) = &flow.config.order else {
            return vec![];
        };
        let mut diags = Vec::new();
        let mut seen = HashSet::new();
        for name in order {
            if !flow.graph.contains(name) {
                diags.push(error(
                    self.name(),
                    format!("Explicit order names unknown step '{name}'"),
                    Some(name),
                ));
            }
            if !seen.insert(name.as_str()) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Explicit order lists '{name}' more than once"),
                    step: Some(name.clone()),
                });
            }
        }
        diags
    }
}

struct PrerequisiteCycleRule;
impl LintRule for PrerequisiteCycleRule {
    fn name(&self) -> &str { "prerequisite_cycle" }
    fn apply(&self, flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
        let map = static_prerequisite_map(flow);
        if map.is_empty() {
            return vec![];
        }
        let declared = flow.graph.declaration_order();
        if topological_order(&declared, &map).is_some() {
            return vec![];
        }
        vec![Diagnostic {
            rule: self.name().into(),
            severity: Severity::Warning,
            message: "Prerequisite graph has a cycle; steps will use declaration order".into(),
            step: None,
        }]
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn built_in_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(NonEmptyRule),
        Box::new(InitialStepRule),
        Box::new(NextTargetsRule),
        Box::new(PrerequisiteRefsRule),
        Box::new(OrderRefsRule),
        Box::new(PrerequisiteCycleRule),
    ]
}

/// Run every built-in rule.
pub fn validate(flow: &FlowDefinition<'_>) -> Vec<Diagnostic> {
    built_in_rules()
        .iter()
        .flat_map(|rule| rule.apply(flow))
        .collect()
}

/// Run every rule and fail on the first `Error`; warnings are returned.
pub fn validate_or_raise(flow: &FlowDefinition<'_>) -> Result<Vec<Diagnostic>> {
    let diags = validate(flow);
    if let Some(err) = diags.iter().find(|d| d.severity == Severity::Error) {
        return Err(FlowError::InvalidGraph(format!("[{}] {}", err.rule, err.message)));
    }
    Ok(diags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepDefinition;

    fn check(graph: &StepGraph, config: &FlowConfig, initial: &str) -> Vec<Diagnostic> {
        validate(&FlowDefinition {
            graph,
            config,
            initial_step: initial,
        })
    }

    fn rules(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_linear_flow_has_no_diagnostics() {
        let graph = StepGraph::linear(["a", "b", "c"]).unwrap();
        assert!(check(&graph, &FlowConfig::default(), "a").is_empty());
    }

    #[test]
    fn empty_graph_is_an_error() {
        let graph = StepGraph::default();
        let diags = check(&graph, &FlowConfig::default(), "a");
        assert_eq!(rules(&diags), vec!["non_empty"]);
    }

    #[test]
    fn unknown_initial_step() {
        let graph = StepGraph::linear(["a"]).unwrap();
        let diags = check(&graph, &FlowConfig::default(), "nope");
        assert_eq!(rules(&diags), vec!["initial_step"]);
        assert_eq!(diags[0].step.as_deref(), Some("nope"));
    }

    #[test]
    fn unknown_next_target() {
        let graph = StepGraph::builder()
            .step("a", StepDefinition::new().next(["ghost"]))
            .build()
            .unwrap();
        let diags = check(&graph, &FlowConfig::default(), "a");
        assert_eq!(rules(&diags), vec!["next_targets"]);
        assert!(diags[0].message.contains("ghost"));
    }

    #[test]
    fn computed_next_is_not_checked_statically() {
        let graph = StepGraph::builder()
            .step("a", StepDefinition::new().next_when(|_, _| "ghost"))
            .build()
            .unwrap();
        assert!(check(&graph, &FlowConfig::default(), "a").is_empty());
    }

    #[test]
    fn unknown_prerequisites_from_steps_and_config() {
        let graph = StepGraph::builder()
            .step("a", StepDefinition::new().prerequisites(["ghost"]))
            .build()
            .unwrap();
        let config = FlowConfig::default().with_prerequisites([("phantom", ["a"])]);
        let diags = check(&graph, &config, "a");
        assert_eq!(rules(&diags), vec!["prerequisite_refs", "prerequisite_refs"]);
    }

    #[test]
    fn order_refs_errors_and_duplicate_warnings() {
        let graph = StepGraph::linear(["a", "b"]).unwrap();
        let config = FlowConfig::default().with_order(["a", "a", "zzz"]);
        let diags = check(&graph, &config, "a");
        let severities: Vec<_> = diags.iter().map(|d| d.severity).collect();
        assert_eq!(severities, vec![Severity::Warning, Severity::Error]);
    }

    #[test]
    fn prerequisite_cycle_is_a_warning() {
        let graph = StepGraph::linear(["a", "b"]).unwrap();
        let config = FlowConfig::default().with_prerequisites([("a", ["b"]), ("b", ["a"])]);
        let diags = validate_or_raise(&FlowDefinition {
            graph: &graph,
            config: &config,
            initial_step: "a",
        })
        .unwrap();
        assert_eq!(rules(&diags), vec!["prerequisite_cycle"]);
    }

    #[test]
    fn validate_or_raise_fails_on_error() {
        let graph = StepGraph::linear(["a"]).unwrap();
        let config = FlowConfig::default();
        let err = validate_or_raise(&FlowDefinition {
            graph: &graph,
            config: &config,
            initial_step: "b",
        })
        .unwrap_err();
        match err {
            FlowError::InvalidGraph(msg) => assert!(msg.contains("initial_step")),
            other => panic!("Expected InvalidGraph, got: {other:?}"),
        }
    }
}
