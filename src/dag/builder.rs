//! DAG builder for constructing dependency graphs from task definitions.
//!
//! The builder takes tasks in declaration order with their dependencies and
//! constructs a directed acyclic graph that the sequencer assigns phases over.

use crate::errors::{Result, TaskerError};
use crate::state::Task;
use std::collections::{HashMap, HashSet};

/// Index into the task list, which is also the declaration index.
pub type TaskIndex = usize;

/// The parts of a task the graph cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: String,
    pub depends_on: Vec<String>,
    pub steel_thread: bool,
    pub min_phase: Option<u32>,
}

impl TaskNode {
    pub fn new(id: &str, deps: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            steel_thread: false,
            min_phase: None,
        }
    }

    pub fn steel(mut self) -> Self {
        self.steel_thread = true;
        self
    }

    pub fn with_min_phase(mut self, phase: u32) -> Self {
        self.min_phase = Some(phase);
        self
    }
}

impl From<&Task> for TaskNode {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            depends_on: task.depends_on.clone(),
            steel_thread: task.steel_thread,
            min_phase: task.min_phase,
        }
    }
}

/// A directed acyclic graph of tasks.
#[derive(Debug)]
pub struct TaskGraph {
    /// Tasks indexed by declaration position
    tasks: Vec<TaskNode>,
    /// Forward edges: index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// Reverse edges: index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn node(&self, index: TaskIndex) -> Option<&TaskNode> {
        self.tasks.get(index)
    }

    pub fn id(&self, index: TaskIndex) -> &str {
        self.tasks.get(index).map_or("", |t| t.id.as_str())
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.tasks
    }

    /// Tasks that depend on the given task (forward edges).
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task depends on (reverse edges).
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }
}

/// Builder for constructing task graphs.
pub struct DagBuilder {
    tasks: Vec<TaskNode>,
}

impl DagBuilder {
    /// Create a builder over tasks given in declaration order.
    pub fn new(tasks: Vec<TaskNode>) -> Self {
        Self { tasks }
    }

    /// Build from document tasks, ordered by declaration index.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut tasks: Vec<&Task> = tasks.into_iter().collect();
        tasks.sort_by_key(|t| (t.order, t.id.as_str()));
        Self::new(tasks.into_iter().map(TaskNode::from).collect())
    }

    /// Build the task graph.
    ///
    /// This validates the graph structure:
    /// - Task ids are unique
    /// - All dependencies reference existing tasks
    /// - No cycles are allowed; a cycle is reported with its full path
    pub fn build(self) -> Result<TaskGraph> {
        let mut index_map = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if index_map.insert(task.id.clone(), i).is_some() {
                return Err(TaskerError::DuplicateTask {
                    id: task.id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];

        for (to_idx, task) in self.tasks.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &task.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| TaskerError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })?;
                if !seen.insert(from_idx) {
                    continue;
                }
                // from must complete before to
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            tasks: self.tasks,
            forward_edges,
            reverse_edges,
        };

        if let Some(cycle) = detect_cycle(&graph.reverse_edges) {
            return Err(TaskerError::Cycle {
                path: cycle.into_iter().map(|i| graph.id(i).to_string()).collect(),
            });
        }

        Ok(graph)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Three-color depth-first search along dependency edges.
///
/// Returns the first cycle found as a closed path `[a, b, ..., a]` where
/// each task depends on the next one.
fn detect_cycle(dependencies: &[Vec<TaskIndex>]) -> Option<Vec<TaskIndex>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut path: Vec<TaskIndex> = Vec::new();

    for root in 0..dependencies.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::Visiting;
        path.push(root);
        let mut stack: Vec<(TaskIndex, usize)> = vec![(root, 0)];

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            match dependencies[node].get(top.1) {
                Some(&next) => {
                    top.1 += 1;
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::Visiting;
                            path.push(next);
                            stack.push((next, 0));
                        }
                        Mark::Visiting => {
                            let start = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle = path[start..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
    }
    None
}

/// Find a dependency cycle among tasks, ignoring references to unknown ids.
pub fn find_cycle<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Option<Vec<String>> {
    let mut tasks: Vec<&Task> = tasks.into_iter().collect();
    tasks.sort_by_key(|t| (t.order, t.id.as_str()));
    let index: HashMap<&str, TaskIndex> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let dependencies: Vec<Vec<TaskIndex>> = tasks
        .iter()
        .map(|t| {
            t.depends_on
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();
    detect_cycle(&dependencies)
        .map(|cycle| cycle.into_iter().map(|i| tasks[i].id.clone()).collect())
}
