//! Step ordering: explicit order, topological sort of prerequisites, or
//! declaration order.

use std::collections::{HashMap, VecDeque};

use crate::config::PrerequisiteMap;

/// Kahn's algorithm over the prerequisite graph.
///
/// Nodes are the steps of `declared` that appear in `prerequisites`, either
/// as a key or as a prerequisite.  Ties are broken by declaration order.
/// Returns `None` when the graph has a cycle.  Names not in `declared` are
/// ignored.
pub fn topological_order(declared: &[String], prerequisites: &PrerequisiteMap) -> Option<Vec<String>> {
    let position: HashMap<&str, usize> = declared
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut in_graph = vec![false; declared.len()];
    let mut in_degree = vec![0usize; declared.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); declared.len()];

    for (step, prereqs) in prerequisites {
        let Some(&to) = position.get(step.as_str()) else {
            continue;
        };
        in_graph[to] = true;
        for prereq in prereqs {
            let Some(&from) = position.get(prereq.as_str()) else {
                continue;
            };
            in_graph[from] = true;
            in_degree[to] += 1;
            dependents[from].push(to);
        }
    }
    for list in &mut dependents {
        list.sort_unstable();
    }

    let node_count = in_graph.iter().filter(|&&b| b).count();
    let mut queue: VecDeque<usize> = (0..declared.len())
        .filter(|&i| in_graph[i] && in_degree[i] == 0)
        .collect();
    let mut sorted = Vec::with_capacity(node_count);

    while let Some(node) = queue.pop_front() {
        sorted.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted.len() < node_count {
        return None;
    }
    Some(sorted.into_iter().map(|i| declared[i].clone()).collect())
}

/// Full step order.
///
/// `explicit` wins outright.  Otherwise the prerequisite graph is sorted and
/// every step absent from it is appended in declaration order.  A cycle, or
/// no graph at all, yields declaration order.
pub fn ordered_steps(
    declared: &[String],
    explicit: Option<&[String]>,
    prerequisites: Option<&PrerequisiteMap>,
) -> Vec<String> {
    if let Some(order) = explicit {
        return order.to_vec();
    }
    let Some(prerequisites) = prerequisites.filter(|p| !p.is_empty()) else {
        return declared.to_vec();
    };
    match topological_order(declared, prerequisites) {
        Some(mut sorted) => {
            let rest: Vec<String> = declared
                .iter()
                .filter(|name| !sorted.contains(name))
                .cloned()
                .collect();
            sorted.extend(rest);
            sorted
        }
        None => {
            tracing::debug!("Prerequisite cycle detected, using declaration order");
            declared.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn prereqs(edges: &[(&str, &[&str])]) -> PrerequisiteMap {
        edges
            .iter()
            .map(|(k, v)| (k.to_string(), names(v)))
            .collect()
    }

    #[test]
    fn sorts_prerequisites_before_dependents() {
        let declared = names(&["review", "billing", "account"]);
        let map = prereqs(&[("review", &["billing"]), ("billing", &["account"])]);
        assert_eq!(
            topological_order(&declared, &map).unwrap(),
            vec!["account", "billing", "review"]
        );
    }

    #[test]
    fn ties_follow_declaration_order() {
        let declared = names(&["step1", "step2", "step3"]);
        let map = prereqs(&[("step3", &["step1", "step2"])]);
        assert_eq!(
            topological_order(&declared, &map).unwrap(),
            vec!["step1", "step2", "step3"]
        );
    }

    #[test]
    fn cycle_returns_none() {
        let declared = names(&["a", "b", "c"]);
        let map = prereqs(&[("a", &["b"]), ("b", &["a"])]);
        assert!(topological_order(&declared, &map).is_none());
    }

    #[test]
    fn steps_outside_graph_are_appended() {
        let declared = names(&["intro", "b", "a", "outro"]);
        let map = prereqs(&[("b", &["a"])]);
        assert_eq!(
            ordered_steps(&declared, None, Some(&map)),
            vec!["a", "b", "intro", "outro"]
        );
    }

    #[test]
    fn cycle_falls_back_to_declaration_order() {
        let declared = names(&["a", "b", "c"]);
        let map = prereqs(&[("a", &["c"]), ("c", &["a"])]);
        assert_eq!(ordered_steps(&declared, None, Some(&map)), declared);
    }

    #[test]
    fn explicit_order_wins() {
        let declared = names(&["a", "b", "c"]);
        let explicit = names(&["c", "a", "b"]);
        let map = prereqs(&[("c", &["a"])]);
        assert_eq!(
            ordered_steps(&declared, Some(&explicit), Some(&map)),
            explicit
        );
    }

    #[test]
    fn no_graph_is_declaration_order() {
        let declared = names(&["x", "y"]);
        assert_eq!(ordered_steps(&declared, None, None), declared);
        assert_eq!(
            ordered_steps(&declared, None, Some(&PrerequisiteMap::new())),
            declared
        );
    }

    #[test]
    fn unknown_names_are_ignored() {
        let declared = names(&["a", "b"]);
        let map = prereqs(&[("b", &["ghost"]), ("phantom", &["a"])]);
        assert_eq!(topological_order(&declared, &map).unwrap(), vec!["b"]);
    }

    #[test]
    fn every_step_follows_its_transitive_prerequisites() {
        let declared = names(&["f", "e", "d", "c", "b", "a"]);
        let map = prereqs(&[
            ("f", &["e", "a"]),
            ("e", &["d"]),
            ("d", &["c", "b"]),
            ("c", &["a"]),
            ("b", &["a"]),
        ]);
        let order = ordered_steps(&declared, None, Some(&map));
        let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
        for (step, reqs) in &map {
            for req in reqs {
                assert!(
                    pos(req.as_str()) < pos(step.as_str()),
                    "{req} must precede {step}: {order:?}"
                );
            }
        }
    }
}
