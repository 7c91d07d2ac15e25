//! Property tests over randomly shaped step graphs.

use std::sync::{Arc, Mutex};

use cvegenie_core::{
    Artifacts, Capability, CapabilityRegistry, DagExecutor, EventType, ExecutionPlan,
    ExecutorError, FnCapability, MemoryResultBus, PlanError, PlanStep, Profile, ResultBus,
    StepConfig,
};
use proptest::prelude::*;
use serde_json::{json, Value};

const CVE: &str = "CVE-2022-0001";

/// A DAG over `n` nodes: node `j` requires node `i` when `i < j` and the
/// edge flag is set. Declaration order is a shuffle of the nodes.
#[derive(Debug, Clone)]
struct Dag {
    n: usize,
    requires: Vec<Vec<usize>>,
    declared: Vec<usize>,
}

fn arb_dag() -> impl Strategy<Value = Dag> {
    (1usize..9).prop_flat_map(|n| {
        let edges = prop::collection::vec(any::<bool>(), n * (n - 1) / 2);
        let declared = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        (Just(n), edges, declared).prop_map(|(n, edges, declared)| {
            let mut requires = vec![Vec::new(); n];
            let mut flags = edges.into_iter();
            for j in 0..n {
                for i in 0..j {
                    if flags.next().unwrap_or(false) {
                        requires[j].push(i);
                    }
                }
            }
            Dag {
                n,
                requires,
                declared,
            }
        })
    })
}

fn node_id(i: usize) -> String {
    format!("n{i}")
}

fn build_plan(dag: &Dag) -> ExecutionPlan {
    let mut plan = ExecutionPlan::new(CVE, Profile::Freestyle);
    for &i in &dag.declared {
        let mut config = StepConfig::new();
        config.insert("node".into(), json!(i));
        plan.add_step(
            PlanStep::new(node_id(i), "Node", "Node")
                .inputs(dag.requires[i].iter().map(|&d| format!("out_{d}")))
                .outputs([format!("out_{i}")])
                .requires(dag.requires[i].iter().map(|&d| node_id(d)))
                .config(config),
        );
    }
    plan
}

/// Registry whose `Node` capability logs its node and whether every input
/// it received was already produced.
fn recording_registry(log: Arc<Mutex<Vec<(usize, bool)>>>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register("Node", move |_bus: Arc<dyn ResultBus>, config: &StepConfig| {
        let node = config.get("node").and_then(Value::as_u64).unwrap_or(u64::MAX) as usize;
        let log = Arc::clone(&log);
        Box::new(FnCapability(move |inputs: &Artifacts| -> anyhow::Result<Artifacts> {
            let inputs_ready = inputs.values().all(|v| !v.is_null());
            log.lock().unwrap().push((node, inputs_ready));
            Ok(Artifacts::from([(format!("out_{node}"), json!(node))]))
        })) as Box<dyn Capability>
    });
    registry
}

/// Smallest-declaration-index-first Kahn order, as node numbers.
fn expected_order(dag: &Dag) -> Vec<usize> {
    let mut done = vec![false; dag.n];
    let mut order = Vec::with_capacity(dag.n);
    while order.len() < dag.n {
        let next = dag
            .declared
            .iter()
            .copied()
            .find(|&i| !done[i] && dag.requires[i].iter().all(|&d| done[d]));
        match next {
            Some(i) => {
                done[i] = true;
                order.push(i);
            }
            None => break,
        }
    }
    order
}

proptest! {
    #[test]
    fn dependencies_complete_before_dependents(dag in arb_dag()) {
        let bus = Arc::new(MemoryResultBus::new(CVE));
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = DagExecutor::new(build_plan(&dag), bus.clone(), recording_registry(Arc::clone(&log)))
            .execute();
        prop_assert!(result.is_ok(), "{:?}", result.as_ref().err());
        let artifacts = result.unwrap_or_default();

        let invoked = log.lock().unwrap().clone();
        prop_assert_eq!(invoked.len(), dag.n);
        prop_assert!(invoked.iter().all(|&(_, ready)| ready));

        let order: Vec<usize> = invoked.iter().map(|&(node, _)| node).collect();
        prop_assert_eq!(&order, &expected_order(&dag));

        let events = bus.events();
        let seq_of = |event_type: EventType, node: usize| {
            let id = node_id(node);
            events
                .iter()
                .find(|e| e.event_type == event_type && e.step_id.as_deref() == Some(id.as_str()))
                .map(|e| e.seq)
        };
        for (j, deps) in dag.requires.iter().enumerate() {
            let started = seq_of(EventType::StepStart, j);
            prop_assert!(started.is_some());
            for &i in deps {
                let completed = seq_of(EventType::StepComplete, i);
                prop_assert!(completed.is_some());
                prop_assert!(completed < started, "n{} must complete before n{} starts", i, j);
            }
        }

        for i in 0..dag.n {
            prop_assert_eq!(artifacts.get(&format!("out_{i}")), Some(&json!(i)));
        }
    }

    #[test]
    fn back_edge_is_rejected_before_any_step(dag in arb_dag(), pick in any::<prop::sample::Index>()) {
        let edges: Vec<(usize, usize)> = dag
            .requires
            .iter()
            .enumerate()
            .flat_map(|(j, deps)| deps.iter().map(move |&i| (i, j)))
            .collect();
        prop_assume!(!edges.is_empty());
        let (i, j) = edges[pick.index(edges.len())];

        let mut plan = build_plan(&dag);
        let first = node_id(i);
        let last = node_id(j);
        if let Some(step) = plan.steps.iter_mut().find(|s| s.id == first) {
            step.requires.push(last);
        }

        let bus = Arc::new(MemoryResultBus::new(CVE));
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = DagExecutor::new(plan, bus.clone(), recording_registry(Arc::clone(&log)))
            .execute()
            .unwrap_err();

        prop_assert!(
            matches!(err, ExecutorError::Plan(PlanError::DependencyCycle { .. })),
            "{}",
            err
        );
        prop_assert!(log.lock().unwrap().is_empty());
        prop_assert_eq!(bus.event_types(), vec![EventType::PlanFailed]);
    }
}
