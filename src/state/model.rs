//! Orchestration document types.

use crate::errors::{Result, TaskerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: &str = "2.0";

/// Status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Blocked,
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Complete,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Skipped,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }

    /// Whether a dependent may proceed past a task in this status.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named stage of the overall planning workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[default]
    Ingestion,
    SpecReview,
    Logical,
    Physical,
    Definition,
    Validation,
    Sequencing,
    Ready,
    Executing,
    Complete,
}

impl WorkflowPhase {
    pub const ORDER: [WorkflowPhase; 10] = [
        WorkflowPhase::Ingestion,
        WorkflowPhase::SpecReview,
        WorkflowPhase::Logical,
        WorkflowPhase::Physical,
        WorkflowPhase::Definition,
        WorkflowPhase::Validation,
        WorkflowPhase::Sequencing,
        WorkflowPhase::Ready,
        WorkflowPhase::Executing,
        WorkflowPhase::Complete,
    ];

    pub fn next(&self) -> Option<WorkflowPhase> {
        let idx = Self::ORDER.iter().position(|p| p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::SpecReview => "spec_review",
            Self::Logical => "logical",
            Self::Physical => "physical",
            Self::Definition => "definition",
            Self::Validation => "validation",
            Self::Sequencing => "sequencing",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseState {
    pub current: WorkflowPhase,
    #[serde(default)]
    pub completed: Vec<WorkflowPhase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
}

/// A file a task declares it will touch, relative to the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub action: FileAction,
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub category: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Partial,
    Fail,
}

impl std::str::FromStr for Verdict {
    type Err = TaskerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pass" => Ok(Verdict::Pass),
            "partial" => Ok(Verdict::Partial),
            "fail" => Ok(Verdict::Fail),
            _ => Err(TaskerError::invalid(format!(
                "invalid verdict '{}': expected pass, partial or fail",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub score: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verdict: Verdict,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
    pub verified_at: DateTime<Utc>,
}

/// Pre-attempt copies taken when a task starts, used to roll back a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub attempt: u32,
    /// Snapshot directory relative to the planning directory.
    pub dir: String,
    /// Files that existed and were copied into `dir`.
    #[serde(default)]
    pub preserved: Vec<String>,
    /// Declared files that did not exist before the attempt.
    #[serde(default)]
    pub absent: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Execution phase assigned by the sequencer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    /// Declaration index; ties within a phase break on it.
    #[serde(default)]
    pub order: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Inverse of `depends_on`, derived by the sequencer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub steel_thread: bool,
    /// Earliest phase this task may be placed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_phase: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,
    /// Extra artifacts read at execution time, relative to the target directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reads: Vec<String>,
    /// Definition file this task was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Failed tasks whose failure currently blocks this one.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_created: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<AttemptSnapshot>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TaskStatus::Pending,
            phase: None,
            order: 0,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            steel_thread: false,
            min_phase: None,
            files: Vec::new(),
            reads: Vec::new(),
            file: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            failure: None,
            blocked_by: BTreeSet::new(),
            skip_reason: None,
            verification: None,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            snapshot: None,
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Sort key for deterministic listing: phase, then declaration order, then id.
    pub fn sort_key(&self) -> (u32, usize, &str) {
        (self.phase.unwrap_or(u32::MAX), self.order, self.id.as_str())
    }
}

/// Aggregate execution counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Execution {
    #[serde(default)]
    pub current_phase: u32,
    #[serde(default)]
    pub active_tasks: Vec<String>,
    #[serde(default)]
    pub completed_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionInitialized,
    TasksLoaded,
    TasksSequenced,
    TaskReady,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskBlocked,
    TaskUnblocked,
    TaskRetried,
    TaskSkipped,
    RollbackApplied,
    VerificationRecorded,
    TokensLogged,
    PhaseAdvanced,
    CheckpointCreated,
    CheckpointUpdated,
    CheckpointCleared,
    RecoveryReconciled,
    OrphanResolved,
    BundlePrepared,
    BundleDrift,
    HaltRequested,
    HaltConfirmed,
    ExecutionResumed,
    StateRecovered,
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// Outcome slot of one task within a dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlotOutcome {
    #[default]
    Pending,
    Complete,
    Failed,
    /// Orphan reset to pending by an operator decision.
    Requeued,
}

impl SlotOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSlot {
    pub task_id: String,
    #[serde(default)]
    pub outcome: SlotOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One in-flight dispatch batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub slots: Vec<CheckpointSlot>,
}

impl Checkpoint {
    pub fn slot(&self, task_id: &str) -> Option<&CheckpointSlot> {
        self.slots.iter().find(|s| s.task_id == task_id)
    }

    pub fn slot_mut(&mut self, task_id: &str) -> Option<&mut CheckpointSlot> {
        self.slots.iter_mut().find(|s| s.task_id == task_id)
    }

    pub fn pending(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| !s.outcome.is_terminal())
            .map(|s| s.task_id.clone())
            .collect()
    }

    pub fn is_settled(&self) -> bool {
        self.slots.iter().all(|s| s.outcome.is_terminal())
    }
}

/// Cooperative halt flag checked by the coordinator between batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HaltInfo {
    pub requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<DateTime<Utc>>,
}

/// The orchestration document. One per session; the unit of locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub version: String,
    pub phase: PhaseState,
    pub target_dir: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub execution: Execution,
    /// Primary end-to-end chain identified by the sequencer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steel_thread: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltInfo>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Document {
    pub fn new(target_dir: impl Into<String>) -> Self {
        let target_dir = target_dir.into();
        let mut doc = Self {
            version: SCHEMA_VERSION.to_string(),
            phase: PhaseState::default(),
            target_dir: target_dir.clone(),
            created_at: Utc::now(),
            updated_at: None,
            tasks: BTreeMap::new(),
            execution: Execution::default(),
            steel_thread: Vec::new(),
            checkpoint: None,
            halt: None,
            events: Vec::new(),
        };
        doc.record(
            EventKind::SessionInitialized,
            None,
            serde_json::json!({ "target_dir": target_dir }),
        );
        doc
    }

    /// Append an event. Events are never edited or removed.
    pub fn record(&mut self, kind: EventKind, task_id: Option<&str>, details: serde_json::Value) {
        self.events.push(Event {
            timestamp: Utc::now(),
            kind,
            task_id: task_id.map(str::to_string),
            details,
        });
    }

    pub fn task(&self, id: &str) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| TaskerError::UnknownTask { id: id.to_string() })
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| TaskerError::UnknownTask { id: id.to_string() })
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    /// Task ids in declaration order.
    pub fn declared_ids(&self) -> Vec<String> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.order, t.id.as_str()));
        tasks.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Tasks that list `id` as a dependency, in declaration order.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let mut dependents: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.depends_on.iter().any(|d| d == id))
            .collect();
        dependents.sort_by_key(|t| (t.order, t.id.as_str()));
        dependents.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Whether every dependency of `id` is complete or skipped.
    pub fn dependencies_satisfied(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|task| {
            task.depends_on.iter().all(|dep| {
                self.status_of(dep)
                    .is_some_and(|s| s.satisfies_dependency())
            })
        })
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.as_ref().is_some_and(|h| h.requested)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal_and_satisfying() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Skipped.satisfies_dependency());
        assert!(!TaskStatus::Failed.satisfies_dependency());
    }

    #[test]
    fn test_workflow_phase_walks_fixed_order() {
        assert_eq!(WorkflowPhase::Ingestion.next(), Some(WorkflowPhase::SpecReview));
        assert_eq!(WorkflowPhase::Executing.next(), Some(WorkflowPhase::Complete));
        assert_eq!(WorkflowPhase::Complete.next(), None);
    }

    #[test]
    fn test_new_document_records_initialization() {
        let doc = Document::new("/work/app");
        assert_eq!(doc.version, SCHEMA_VERSION);
        assert_eq!(doc.phase.current, WorkflowPhase::Ingestion);
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].kind, EventKind::SessionInitialized);
    }

    #[test]
    fn test_dependents_follow_declaration_order() {
        let mut doc = Document::new("/work");
        doc.tasks.insert("a".into(), Task::new("a", "A").with_order(0));
        doc.tasks
            .insert("z".into(), Task::new("z", "Z").with_deps(&["a"]).with_order(1));
        doc.tasks
            .insert("b".into(), Task::new("b", "B").with_deps(&["a"]).with_order(2));
        assert_eq!(doc.dependents_of("a"), vec!["z", "b"]);
        assert_eq!(doc.declared_ids(), vec!["a", "z", "b"]);
    }

    #[test]
    fn test_serialization_round_trips() {
        let mut doc = Document::new("/work");
        let mut task = Task::new("T1", "First").with_order(0);
        task.phase = Some(1);
        task.blocked_by.insert("T0".into());
        task.failure = Some(TaskFailure {
            category: "test".into(),
            message: "assertion failed".into(),
            retryable: true,
        });
        doc.tasks.insert("T1".into(), task);
        doc.execution.total_cost_usd = 0.125;
        doc.checkpoint = Some(Checkpoint {
            batch_id: "batch-1".into(),
            created_at: Utc::now(),
            updated_at: None,
            slots: vec![CheckpointSlot {
                task_id: "T1".into(),
                outcome: SlotOutcome::Pending,
                updated_at: None,
            }],
        });

        let encoded = serde_json::to_string(&doc).unwrap();
        let decoded: Document = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_verdict_parses_case_insensitively() {
        assert_eq!("PASS".parse::<Verdict>().unwrap(), Verdict::Pass);
        assert!("maybe".parse::<Verdict>().is_err());
    }
}
