//! Task graph resolution: requested ids in, conflict-free dependency-complete
//! ordered plan out.
//!
//! Resolution is deterministic and idempotent: the same requested set against
//! the same manifests always yields the same ordered list, and resolving a
//! resolved list is a no-op. The resolver never guesses — unsatisfied
//! `one_of` groups and conflicts are surfaced, not auto-fixed.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::core::error::ResolveError;
use crate::core::types::{ExecutionMode, Plan, PlanGroup};
use crate::manifest::{Manifests, ProfileDefinition};

/// Resolve a requested task-id set into a dependency-ordered list.
///
/// Steps: dedup (insertion order), transitive `required` expansion, cycle
/// detection, blocking `one_of` check, pairwise conflict check, then a
/// topological order with insertion-order tie-breaking.
pub fn resolve(manifests: &Manifests, requested: &[String]) -> Result<Vec<String>, ResolveError> {
    let mut order: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for id in requested {
        if manifests.task(id).is_none() {
            return Err(ResolveError::UnknownTask {
                id: id.clone(),
                requested_by: None,
            });
        }
        if seen.insert(id.clone()) {
            order.push(id.clone());
        }
    }

    // Expand `required` transitively; the worklist keeps insertion order so
    // later topological tie-breaks stay deterministic.
    let mut index = 0;
    while index < order.len() {
        let id = order[index].clone();
        let Some(task) = manifests.task(&id) else {
            return Err(ResolveError::UnknownTask {
                id,
                requested_by: None,
            });
        };
        for dep in &task.dependencies.required {
            if manifests.task(dep).is_none() {
                return Err(ResolveError::UnknownTask {
                    id: dep.clone(),
                    requested_by: Some(id.clone()),
                });
            }
            if seen.insert(dep.clone()) {
                order.push(dep.clone());
            }
        }
        index += 1;
    }

    if let Some(path) = find_required_cycle(manifests, &order) {
        return Err(ResolveError::Cycle { path });
    }

    // `one_of` groups block rather than auto-select: the user picks.
    for task in order.iter().filter_map(|id| manifests.task(id)) {
        let group = &task.dependencies.one_of;
        if !group.is_empty() && !group.iter().any(|alt| seen.contains(alt)) {
            return Err(ResolveError::UnsatisfiedChoice {
                task: task.id.clone(),
                alternatives: group.clone(),
            });
        }
    }

    for task in order.iter().filter_map(|id| manifests.task(id)) {
        for other in &task.conflicts_with {
            if seen.contains(other) {
                // Name the pair in resolved order for a stable message.
                let (first, second) = if position(&order, &task.id) < position(&order, other) {
                    (task.id.clone(), other.clone())
                } else {
                    (other.clone(), task.id.clone())
                };
                return Err(ResolveError::Conflict { first, second });
            }
        }
    }

    let sorted = topo_sort(manifests, &order, &seen)?;
    debug!(requested = requested.len(), resolved = sorted.len(), "task set resolved");
    Ok(sorted)
}

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|o| o == id).unwrap_or(usize::MAX)
}

/// Edges that constrain ordering: `required` deps plus whichever `one_of`
/// and `optional` alternatives are actually present in the set.
fn ordering_deps<'a>(
    manifests: &'a Manifests,
    id: &str,
    present: &HashSet<String>,
) -> Vec<&'a String> {
    let Some(task) = manifests.task(id) else {
        return Vec::new();
    };
    task.dependencies
        .required
        .iter()
        .chain(task.dependencies.one_of.iter().filter(|d| present.contains(*d)))
        .chain(task.dependencies.optional.iter().filter(|d| present.contains(*d)))
        .collect()
}

/// DFS over `required` edges restricted to the resolved set; returns the
/// cycle path when one exists. Valid manifests never cycle, but a broken
/// custom layer must be detected, not looped on.
fn find_required_cycle(manifests: &Manifests, order: &[String]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    fn visit<'a>(
        manifests: &'a Manifests,
        id: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> bool {
        match marks.get(id) {
            Some(Mark::Done) => return false,
            Some(Mark::Visiting) => {
                stack.push(id.to_string());
                return true;
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id.to_string());
        if let Some(task) = manifests.task(id) {
            for dep in &task.dependencies.required {
                if visit(manifests, dep, marks, stack) {
                    return true;
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        false
    }

    for id in order {
        let mut stack = Vec::new();
        if visit(manifests, id, &mut marks, &mut stack) {
            return Some(stack);
        }
    }
    None
}

/// Kahn-style topological order; at each step the first (in insertion order)
/// task whose in-set dependencies are all placed goes next.
fn topo_sort(
    manifests: &Manifests,
    order: &[String],
    present: &HashSet<String>,
) -> Result<Vec<String>, ResolveError> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut result: Vec<String> = Vec::with_capacity(order.len());

    while result.len() < order.len() {
        let next = order.iter().find(|id| {
            !placed.contains(id.as_str())
                && ordering_deps(manifests, id, present)
                    .iter()
                    .filter(|dep| present.contains(**dep))
                    .all(|dep| placed.contains(dep.as_str()))
        });
        match next {
            Some(id) => {
                placed.insert(id.as_str());
                result.push(id.clone());
            }
            // Unreachable after the explicit cycle check above; reported
            // rather than spun on.
            None => {
                let remaining: Vec<String> = order
                    .iter()
                    .filter(|id| !placed.contains(id.as_str()))
                    .cloned()
                    .collect();
                return Err(ResolveError::Cycle { path: remaining });
            }
        }
    }
    Ok(result)
}

/// Seed task ids from a chosen profile plus the answers given so far:
/// `required_tasks` + `default_cli_tools` + each answered question's chosen
/// option tasks, in question-flow order.
pub fn seed_from_profile(
    profile: &ProfileDefinition,
    answers: &BTreeMap<String, String>,
) -> Vec<String> {
    fn append(ids: &[String], result: &mut Vec<String>, seen: &mut HashSet<String>) {
        for id in ids {
            if seen.insert(id.clone()) {
                result.push(id.clone());
            }
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut result: Vec<String> = Vec::new();
    append(&profile.required_tasks, &mut result, &mut seen);
    append(&profile.default_cli_tools, &mut result, &mut seen);
    for question in &profile.question_flow {
        if let Some(letter) = answers.get(&question.id)
            && let Some(option) = question.options.iter().find(|o| &o.letter == letter)
        {
            append(&option.tasks, &mut result, &mut seen);
        }
    }
    result
}

/// Group a resolved list into a display plan, categories in first-appearance
/// order, tasks in resolved order within each.
pub fn build_plan(manifests: &Manifests, resolved: Vec<String>, mode: ExecutionMode) -> Plan {
    let mut groups: Vec<PlanGroup> = Vec::new();
    for id in &resolved {
        let category = manifests
            .task(id)
            .map(|task| task.category.clone())
            .unwrap_or_else(|| "general".to_string());
        match groups.iter_mut().find(|group| group.category == category) {
            Some(group) => group.tasks.push(id.clone()),
            None => groups.push(PlanGroup {
                category,
                tasks: vec![id.clone()],
            }),
        }
    }
    Plan {
        tasks: resolved,
        groups,
        mode,
        approved_at: Utc::now(),
    }
}
