//! Topological scheduling of plan steps.
//!
//! Kahn's algorithm over the `requires` graph. Ready steps are taken in
//! declaration order so the schedule is deterministic.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use cvegenie_bus::is_confined;

use crate::plan::{PlanError, PlanResult, PlanStep};

/// Indices into `steps` in a valid execution order.
///
/// Fails with [`PlanError::DuplicateStep`], [`PlanError::UnsafePath`],
/// [`PlanError::UnknownDependency`] or [`PlanError::DependencyCycle`];
/// never partially succeeds.
pub fn topological_order(steps: &[PlanStep]) -> PlanResult<Vec<usize>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        // Step ids and outputs become artifact paths on the bus.
        if let Some(name) = std::iter::once(&step.id)
            .chain(&step.outputs)
            .find(|name| !is_confined(name))
        {
            return Err(PlanError::UnsafePath {
                step: step.id.clone(),
                name: name.clone(),
            });
        }
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep {
                step: step.id.clone(),
            });
        }
    }

    // dependents[i] = steps that require step i
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree: Vec<usize> = vec![0; steps.len()];

    for (i, step) in steps.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for req in &step.requires {
            let dep = *index
                .get(req.as_str())
                .ok_or_else(|| PlanError::UnknownDependency {
                    step: step.id.clone(),
                    requires: req.clone(),
                })?;
            deps.insert(dep);
        }
        in_degree[i] = deps.len();
        for dep in deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != steps.len() {
        let stuck = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg > 0)
            .map(|(i, _)| steps[i].id.clone())
            .collect();
        return Err(PlanError::DependencyCycle { steps: stuck });
    }

    Ok(order)
}
