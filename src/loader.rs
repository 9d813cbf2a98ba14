//! Task definition files and their merge into the document.
//!
//! Definitions live one per file under `<planning>/tasks/`. Files are read in
//! sorted path order, which is also the declaration order used to break
//! ties during sequencing. Every bad file is reported, not just the first.

use crate::dag::{DagBuilder, SequencePlan, TaskNode, sequence_document};
use crate::errors::{Result, TaskFileFailure, TaskerError};
use crate::lifecycle::{promote_ready, resolve_within};
use crate::state::{Document, EventKind, FileSpec, Task, TaskStatus};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

// Compiled once; the pattern is a literal.
static TASK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").unwrap());

/// One task as written by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub steel_thread: bool,
    #[serde(default)]
    pub min_phase: Option<u32>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub reads: Vec<String>,
}

impl TaskDefinition {
    /// Schema checks that serde alone does not cover.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !TASK_ID.is_match(&self.id) {
            problems.push(format!(
                "id '{}' must start with a letter and contain only letters, digits, '_', '.' or '-'",
                self.id
            ));
        }
        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.min_phase == Some(0) {
            problems.push("min_phase must be at least 1".to_string());
        }
        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if dep == &self.id {
                problems.push("task depends on itself".to_string());
            } else if !seen.insert(dep) {
                problems.push(format!("dependency {} listed twice", dep));
            }
        }
        let paths = self
            .files
            .iter()
            .map(|f| f.path.as_str())
            .chain(self.reads.iter().map(String::as_str));
        for path in paths {
            if resolve_within(Path::new("."), path).is_err() {
                problems.push(format!("path '{}' must be relative to the target directory", path));
            }
        }
        problems
    }
}

#[derive(Debug, Clone)]
pub struct LoadedDefinition {
    pub definition: TaskDefinition,
    pub file: PathBuf,
}

fn parse_file(path: &Path) -> std::result::Result<TaskDefinition, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let definition: TaskDefinition = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    let problems = definition.problems();
    if problems.is_empty() {
        Ok(definition)
    } else {
        Err(problems.join(", "))
    }
}

/// Read and validate every `*.json` definition under `dir`.
pub fn load_dir(dir: &Path) -> Result<Vec<LoadedDefinition>> {
    if !dir.is_dir() {
        return Err(TaskerError::invalid(format!(
            "task directory {} does not exist",
            dir.display()
        )));
    }

    let mut loaded = Vec::new();
    let mut failures = Vec::new();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();

    let walker = WalkDir::new(dir).sort_by_file_name().into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                failures.push(TaskFileFailure {
                    file: e.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match parse_file(path) {
            Ok(definition) => {
                if let Some(first) = seen.get(&definition.id) {
                    failures.push(TaskFileFailure {
                        file: path.to_path_buf(),
                        reason: format!(
                            "duplicate task id {} (already defined in {})",
                            definition.id,
                            first.display()
                        ),
                    });
                    continue;
                }
                seen.insert(definition.id.clone(), path.to_path_buf());
                loaded.push(LoadedDefinition {
                    definition,
                    file: path.to_path_buf(),
                });
            }
            Err(reason) => failures.push(TaskFileFailure {
                file: path.to_path_buf(),
                reason,
            }),
        }
    }

    if !failures.is_empty() {
        return Err(TaskerError::TaskLoad {
            count: failures.len(),
            failures,
        });
    }
    tracing::debug!(dir = %dir.display(), count = loaded.len(), "task definitions read");
    Ok(loaded)
}

/// Build graph nodes from definitions, in declaration order.
pub fn graph_nodes(definitions: &[LoadedDefinition]) -> Vec<TaskNode> {
    definitions
        .iter()
        .map(|l| TaskNode {
            id: l.definition.id.clone(),
            depends_on: l.definition.depends_on.clone(),
            steel_thread: l.definition.steel_thread,
            min_phase: l.definition.min_phase,
        })
        .collect()
}

/// Validate definitions as a graph without touching any document.
pub fn plan(definitions: &[LoadedDefinition]) -> Result<SequencePlan> {
    let graph = DagBuilder::new(graph_nodes(definitions)).build()?;
    crate::dag::sequence(&graph)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub ready: Vec<String>,
    pub phases: usize,
}

/// Merge definitions into the document and re-sequence.
///
/// Runtime state of tasks that already exist is kept. A task that vanished
/// from the definitions is dropped only if it never ran.
pub fn merge(doc: &mut Document, definitions: &[LoadedDefinition]) -> Result<MergeSummary> {
    let mut summary = MergeSummary::default();
    let defined: HashSet<&str> = definitions
        .iter()
        .map(|l| l.definition.id.as_str())
        .collect();

    let mut stranded = Vec::new();
    let missing: Vec<String> = doc
        .tasks
        .keys()
        .filter(|id| !defined.contains(id.as_str()))
        .cloned()
        .collect();
    for id in missing {
        let untouched = doc
            .tasks
            .get(&id)
            .is_some_and(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready) && t.attempts == 0);
        if untouched {
            doc.tasks.remove(&id);
            summary.removed.push(id);
        } else {
            stranded.push(id);
        }
    }
    if !stranded.is_empty() {
        return Err(TaskerError::invalid(format!(
            "task(s) {} have execution history but no definition",
            stranded.join(", ")
        )));
    }

    for (order, loaded) in definitions.iter().enumerate() {
        let def = &loaded.definition;
        let file = Some(loaded.file.display().to_string());
        match doc.tasks.get_mut(&def.id) {
            Some(task) => {
                task.name = def.name.clone();
                task.order = order;
                task.depends_on = def.depends_on.clone();
                task.steel_thread = def.steel_thread;
                task.min_phase = def.min_phase;
                task.files = def.files.clone();
                task.reads = def.reads.clone();
                task.file = file;
                summary.updated.push(def.id.clone());
            }
            None => {
                let mut task = Task::new(def.id.clone(), def.name.clone()).with_order(order);
                task.depends_on = def.depends_on.clone();
                task.steel_thread = def.steel_thread;
                task.min_phase = def.min_phase;
                task.files = def.files.clone();
                task.reads = def.reads.clone();
                task.file = file;
                doc.tasks.insert(def.id.clone(), task);
                summary.added.push(def.id.clone());
            }
        }
    }

    // Readiness may have changed with the new edges.
    for task in doc.tasks.values_mut() {
        if task.status == TaskStatus::Ready {
            task.status = TaskStatus::Pending;
        }
    }

    let plan = sequence_document(doc)?;
    summary.phases = plan.phase_count();
    summary.ready = promote_ready(doc);

    doc.record(
        EventKind::TasksLoaded,
        None,
        serde_json::json!({
            "added": summary.added,
            "updated": summary.updated,
            "removed": summary.removed,
        }),
    );
    tracing::info!(
        added = summary.added.len(),
        updated = summary.updated.len(),
        removed = summary.removed.len(),
        "task definitions merged"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn three_tasks(dir: &Path) {
        write(dir, "01-T1.json", r#"{"id": "T1", "name": "scaffold"}"#);
        write(
            dir,
            "02-T2.json",
            r#"{"id": "T2", "name": "api", "depends_on": ["T1"], "files": [{"path": "src/api.rs", "action": "create"}]}"#,
        );
        write(
            dir,
            "03-T3.json",
            r#"{"id": "T3", "name": "cli", "depends_on": ["T1"]}"#,
        );
    }

    #[test]
    fn test_load_dir_reads_in_file_name_order() {
        let dir = tempdir().unwrap();
        three_tasks(dir.path());
        write(dir.path(), "notes.txt", "ignored");
        let loaded = load_dir(dir.path()).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|l| l.definition.id.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn test_load_dir_collects_every_failure() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"id": "1bad", "name": "x"}"#);
        write(dir.path(), "b.json", r#"{"id": "ok", "name": ""}"#);
        write(dir.path(), "c.json", "{ nope");
        write(dir.path(), "d.json", r#"{"id": "T1", "name": "x", "colour": "red"}"#);
        write(dir.path(), "e.json", r#"{"id": "T2", "name": "x", "min_phase": 0}"#);
        write(dir.path(), "f.json", r#"{"id": "T9", "name": "first"}"#);
        write(dir.path(), "g.json", r#"{"id": "T9", "name": "dup"}"#);

        let err = load_dir(dir.path()).unwrap_err();
        let TaskerError::TaskLoad { count, failures } = err else {
            panic!("expected batch failure");
        };
        assert_eq!(count, 6);
        let files: Vec<String> = failures
            .iter()
            .map(|f| f.file.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["a.json", "b.json", "c.json", "d.json", "e.json", "g.json"]);
        assert!(failures[3].reason.contains("colour"));
        assert!(failures[5].reason.contains("duplicate"));
    }

    #[test]
    fn test_problems_reject_escaping_paths() {
        let def = TaskDefinition {
            id: "T1".into(),
            name: "x".into(),
            depends_on: vec!["T1".into()],
            steel_thread: false,
            min_phase: None,
            files: vec![],
            reads: vec!["../secrets".into()],
        };
        let problems = def.problems();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_merge_sequences_and_promotes() {
        let dir = tempdir().unwrap();
        three_tasks(dir.path());
        let loaded = load_dir(dir.path()).unwrap();
        let mut doc = Document::new("/work");
        let summary = merge(&mut doc, &loaded).unwrap();
        assert_eq!(summary.added, vec!["T1", "T2", "T3"]);
        assert_eq!(summary.ready, vec!["T1"]);
        assert_eq!(summary.phases, 2);
        assert_eq!(doc.tasks["T2"].phase, Some(2));
        assert_eq!(doc.tasks["T1"].blocks, vec!["T2", "T3"]);
    }

    #[test]
    fn test_reload_preserves_runtime_state() {
        let dir = tempdir().unwrap();
        three_tasks(dir.path());
        let mut doc = Document::new("/work");
        merge(&mut doc, &load_dir(dir.path()).unwrap()).unwrap();
        crate::lifecycle::start(&mut doc, "T1").unwrap();

        write(dir.path(), "01-T1.json", r#"{"id": "T1", "name": "scaffold v2"}"#);
        let summary = merge(&mut doc, &load_dir(dir.path()).unwrap()).unwrap();
        assert_eq!(summary.updated.len(), 3);
        assert_eq!(doc.tasks["T1"].status, TaskStatus::Running);
        assert_eq!(doc.tasks["T1"].name, "scaffold v2");
    }

    #[test]
    fn test_cycle_aborts_merge() {
        let dir = tempdir().unwrap();
        write(dir.path(), "a.json", r#"{"id": "A", "name": "a", "depends_on": ["B"]}"#);
        write(dir.path(), "b.json", r#"{"id": "B", "name": "b", "depends_on": ["A"]}"#);
        let loaded = load_dir(dir.path()).unwrap();
        let err = plan(&loaded).unwrap_err();
        assert!(matches!(err, TaskerError::Cycle { .. }));
        let mut doc = Document::new("/work");
        assert!(merge(&mut doc, &loaded).is_err());
    }

    #[test]
    fn test_removed_definition_with_history_is_rejected() {
        let dir = tempdir().unwrap();
        three_tasks(dir.path());
        let mut doc = Document::new("/work");
        merge(&mut doc, &load_dir(dir.path()).unwrap()).unwrap();
        crate::lifecycle::start(&mut doc, "T1").unwrap();

        fs::remove_file(dir.path().join("03-T3.json")).unwrap();
        let summary = merge(&mut doc, &load_dir(dir.path()).unwrap()).unwrap();
        assert_eq!(summary.removed, vec!["T3"]);

        fs::remove_file(dir.path().join("01-T1.json")).unwrap();
        fs::write(
            dir.path().join("02-T2.json"),
            r#"{"id": "T2", "name": "api"}"#,
        )
        .unwrap();
        let err = merge(&mut doc, &load_dir(dir.path()).unwrap()).unwrap_err();
        assert!(err.to_string().contains("T1"));
    }
}
