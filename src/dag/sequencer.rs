//! Phase assignment and steel-thread validation.
//!
//! A task's phase is `1 + max(phase of its dependencies)`, or 1 for a task
//! with no dependencies. A task may ask to be placed later with `min_phase`.
//! Within a phase, tasks keep their declaration order.

use super::builder::{DagBuilder, TaskGraph, TaskIndex};
use crate::errors::{Result, TaskerError};
use crate::state::{Document, EventKind};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Output of one sequencing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencePlan {
    /// Phase per task id.
    pub phases: BTreeMap<String, u32>,
    /// Task ids grouped by phase, in declaration order within each group.
    pub waves: Vec<Vec<String>>,
    /// Topological order, preferring earlier declarations.
    pub order: Vec<String>,
    /// Longest chain of steel-thread tasks, upstream first.
    pub steel_thread: Vec<String>,
}

impl SequencePlan {
    pub fn phase_count(&self) -> usize {
        self.waves.len()
    }
}

/// Compute phases, waves and the steel-thread path for a built graph.
pub fn sequence(graph: &TaskGraph) -> Result<SequencePlan> {
    let order = topological_order(graph);
    let mut natural = vec![1u32; graph.len()];
    let mut phase = vec![1u32; graph.len()];

    for &idx in &order {
        let earliest = graph
            .dependencies(idx)
            .iter()
            .map(|&d| phase[d] + 1)
            .max()
            .unwrap_or(1);
        natural[idx] = earliest;
        let requested = graph.node(idx).and_then(|n| n.min_phase).unwrap_or(1);
        phase[idx] = earliest.max(requested);
    }

    validate_steel_thread(graph, &natural, &phase)?;

    let max_phase = phase.iter().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); max_phase as usize];
    for (idx, node) in graph.nodes().iter().enumerate() {
        waves[(phase[idx] - 1) as usize].push(node.id.clone());
    }
    // min_phase can leave gaps; an empty wave is not a phase anyone runs in
    waves.retain(|w| !w.is_empty());

    let phases = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id.clone(), phase[idx]))
        .collect();

    Ok(SequencePlan {
        phases,
        waves,
        order: order.iter().map(|&i| graph.id(i).to_string()).collect(),
        steel_thread: steel_path(graph, &order),
    })
}

/// Kahn's algorithm with the ready queue ordered by declaration index.
fn topological_order(graph: &TaskGraph) -> Vec<TaskIndex> {
    let mut in_degree: Vec<usize> = (0..graph.len())
        .map(|i| graph.dependencies(i).len())
        .collect();
    let mut queue: BinaryHeap<Reverse<TaskIndex>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(Reverse(node)) = queue.pop() {
        order.push(node);
        for &dependent in graph.dependents(node) {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(Reverse(dependent));
            }
        }
    }
    order
}

/// Steel-thread tasks may only depend on other steel-thread tasks and must
/// sit in the earliest phase their dependencies allow.
fn validate_steel_thread(graph: &TaskGraph, natural: &[u32], phase: &[u32]) -> Result<()> {
    for (idx, node) in graph.nodes().iter().enumerate() {
        if !node.steel_thread {
            continue;
        }
        for &dep in graph.dependencies(idx) {
            let upstream = graph.node(dep).is_some_and(|n| n.steel_thread);
            if !upstream {
                return Err(TaskerError::SteelThread {
                    task: node.id.clone(),
                    message: format!(
                        "depends on {}, which is not on the steel thread",
                        graph.id(dep)
                    ),
                });
            }
        }
        if phase[idx] != natural[idx] {
            return Err(TaskerError::SteelThread {
                task: node.id.clone(),
                message: format!(
                    "placed in phase {} but could run in phase {}",
                    phase[idx], natural[idx]
                ),
            });
        }
    }
    Ok(())
}

fn steel_path(graph: &TaskGraph, order: &[TaskIndex]) -> Vec<String> {
    let is_steel = |i: TaskIndex| graph.node(i).is_some_and(|n| n.steel_thread);
    let mut length = vec![0usize; graph.len()];
    let mut prev: Vec<Option<TaskIndex>> = vec![None; graph.len()];

    for &idx in order {
        if !is_steel(idx) {
            continue;
        }
        length[idx] = 1;
        // first-declared dependency wins ties
        let mut deps: Vec<TaskIndex> = graph
            .dependencies(idx)
            .iter()
            .copied()
            .filter(|&d| is_steel(d))
            .collect();
        deps.sort_unstable();
        for dep in deps {
            if length[dep] + 1 > length[idx] {
                length[idx] = length[dep] + 1;
                prev[idx] = Some(dep);
            }
        }
    }

    let mut end: Option<TaskIndex> = None;
    for idx in 0..graph.len() {
        if length[idx] > 0 && end.is_none_or(|e| length[idx] > length[e]) {
            end = Some(idx);
        }
    }

    let mut path = Vec::new();
    let mut cursor = end;
    while let Some(idx) = cursor {
        path.push(graph.id(idx).to_string());
        cursor = prev[idx];
    }
    path.reverse();
    path
}

/// Sequence the document's tasks and write the result back: phases,
/// the derived `blocks` lists and the steel-thread path.
pub fn sequence_document(doc: &mut Document) -> Result<SequencePlan> {
    let graph = DagBuilder::from_tasks(doc.tasks.values()).build()?;
    let plan = sequence(&graph)?;

    for (idx, node) in graph.nodes().iter().enumerate() {
        let blocks: Vec<String> = graph
            .dependents(idx)
            .iter()
            .map(|&d| graph.id(d).to_string())
            .collect();
        if let Some(task) = doc.tasks.get_mut(&node.id) {
            task.phase = plan.phases.get(&node.id).copied();
            task.blocks = blocks;
        }
    }
    doc.steel_thread = plan.steel_thread.clone();
    crate::state::refresh_execution(doc);
    doc.record(
        EventKind::TasksSequenced,
        None,
        serde_json::json!({
            "phases": plan.phase_count(),
            "tasks": graph.len(),
            "steel_thread": plan.steel_thread,
        }),
    );
    tracing::info!(
        tasks = graph.len(),
        phases = plan.phase_count(),
        "tasks sequenced"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::TaskNode;

    fn plan(nodes: Vec<TaskNode>) -> Result<SequencePlan> {
        sequence(&DagBuilder::new(nodes).build()?)
    }

    fn node(id: &str, deps: &[&str]) -> TaskNode {
        TaskNode::new(id, deps)
    }

    #[test]
    fn test_fan_out_scenario() {
        let p = plan(vec![node("T1", &[]), node("T2", &["T1"]), node("T3", &["T1"])]).unwrap();
        assert_eq!(p.phases["T1"], 1);
        assert_eq!(p.phases["T2"], 2);
        assert_eq!(p.phases["T3"], 2);
        assert_eq!(p.waves, vec![vec!["T1"], vec!["T2", "T3"]]);
    }

    #[test]
    fn test_phase_exceeds_every_dependency() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &[]),
            node("d", &["b", "c"]),
            node("e", &["a", "d"]),
            node("f", &["c"]),
        ];
        let p = plan(nodes.clone()).unwrap();
        for n in &nodes {
            for dep in &n.depends_on {
                assert!(p.phases[&n.id] > p.phases[dep], "{} vs {}", n.id, dep);
            }
        }
        assert_eq!(p.phases["e"], 4);
        assert_eq!(p.order.len(), nodes.len());
    }

    #[test]
    fn test_sequencing_is_deterministic() {
        let nodes: Vec<TaskNode> = (0..30)
            .map(|i| {
                let deps: Vec<String> = (0..i)
                    .filter(|j| (i * 7 + j * 3) % 5 == 0)
                    .map(|j| format!("t{}", j))
                    .collect();
                TaskNode {
                    id: format!("t{}", i),
                    depends_on: deps,
                    steel_thread: false,
                    min_phase: None,
                }
            })
            .collect();
        let first = plan(nodes.clone()).unwrap();
        let second = plan(nodes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_min_phase_delays_task() {
        let p = plan(vec![
            node("core", &[]),
            node("harden", &[]).with_min_phase(3),
        ])
        .unwrap();
        assert_eq!(p.phases["harden"], 3);
        assert_eq!(p.waves, vec![vec!["core"], vec!["harden"]]);
    }

    #[test]
    fn test_steel_thread_path_is_longest_chain() {
        let p = plan(vec![
            node("schema", &[]).steel(),
            node("docs", &[]),
            node("api", &["schema"]).steel(),
            node("ui", &["api"]).steel(),
            node("cli", &["schema"]).steel(),
        ])
        .unwrap();
        assert_eq!(p.steel_thread, vec!["schema", "api", "ui"]);
    }

    #[test]
    fn test_steel_thread_rejects_non_steel_dependency() {
        let err = plan(vec![node("docs", &[]), node("api", &["docs"]).steel()]).unwrap_err();
        assert!(matches!(err, TaskerError::SteelThread { ref task, .. } if task == "api"));
    }

    #[test]
    fn test_steel_thread_rejects_delayed_task() {
        let err = plan(vec![node("schema", &[]).steel().with_min_phase(2)]).unwrap_err();
        assert!(err.to_string().contains("could run in phase 1"));
    }

    #[test]
    fn test_sequence_document_sets_phases_and_blocks() {
        use crate::state::Task;
        let mut doc = Document::new("/work");
        doc.tasks.insert("T1".into(), Task::new("T1", "one").with_order(0));
        doc.tasks.insert(
            "T3".into(),
            Task::new("T3", "three").with_deps(&["T1"]).with_order(2),
        );
        doc.tasks.insert(
            "T2".into(),
            Task::new("T2", "two").with_deps(&["T1"]).with_order(1),
        );

        let p = sequence_document(&mut doc).unwrap();
        assert_eq!(p.order, vec!["T1", "T2", "T3"]);
        assert_eq!(doc.tasks["T1"].blocks, vec!["T2", "T3"]);
        assert_eq!(doc.tasks["T3"].phase, Some(2));
        assert_eq!(doc.execution.current_phase, 1);
    }
}
