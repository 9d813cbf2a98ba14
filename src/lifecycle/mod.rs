//! Task lifecycle state machine.
//!
//! ```text
//! pending -> ready -> running -> complete
//!                        |
//!                        +----> failed --retry--> pending
//! pending|ready --(dependency failed)--> blocked --(dependency retried/skipped)--> pending
//! pending|ready|blocked|failed --skip--> skipped
//! ```
//!
//! The functions here are pure mutations of a `Document`; callers run them
//! inside one `StateRepository::update` so the status change, counters and
//! event land in the same write. Cascades over dependents are breadth-first
//! worklists, never recursion.

mod rollback;

pub use rollback::{RollbackReport, resolve_within, rollback, take_snapshot};

use crate::bundle;
use crate::errors::{Result, TaskerError};
use crate::state::{
    self, Document, EventKind, StateRepository, Task, TaskFailure, TaskStatus, Verdict,
    Verification,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::Path;

/// Files reported by a worker for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesTouched {
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

/// What a failure did to the rest of the graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureOutcome {
    pub blocked: Vec<String>,
    pub rollback: RollbackReport,
}

/// Tasks eligible to start: pending or ready with every dependency complete
/// or skipped, ordered by phase, then declaration order.
pub fn ready_tasks(doc: &Document) -> Vec<&Task> {
    let mut ready: Vec<&Task> = doc
        .tasks
        .values()
        .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
        .filter(|t| doc.dependencies_satisfied(&t.id))
        .collect();
    ready.sort_by_key(|t| t.sort_key());
    ready
}

/// Promote every eligible pending task to ready. Returns the promoted ids.
pub fn promote_ready(doc: &mut Document) -> Vec<String> {
    let eligible: Vec<String> = ready_tasks(doc)
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .map(|t| t.id.clone())
        .collect();
    for id in &eligible {
        mark_ready(doc, id);
    }
    eligible
}

fn mark_ready(doc: &mut Document, id: &str) {
    if let Some(task) = doc.tasks.get_mut(id) {
        task.status = TaskStatus::Ready;
        doc.record(EventKind::TaskReady, Some(id), serde_json::Value::Null);
    }
}

fn reject(task: &Task, action: &'static str) -> TaskerError {
    TaskerError::InvalidTransition {
        id: task.id.clone(),
        status: task.status.to_string(),
        action,
    }
}

/// `ready -> running`. Rejects anything not currently eligible, which
/// guards against dispatching the same task twice.
pub fn start(doc: &mut Document, id: &str) -> Result<()> {
    state::halt::ensure_dispatch_allowed(doc)?;
    let task = doc.task(id)?;
    let eligible = matches!(task.status, TaskStatus::Ready | TaskStatus::Pending)
        && doc.dependencies_satisfied(id);
    if !eligible {
        return Err(reject(task, "start"));
    }

    let task = doc.task_mut(id)?;
    task.status = TaskStatus::Running;
    task.attempts = task.attempts.max(1);
    task.started_at = Some(Utc::now());
    task.completed_at = None;
    task.duration_seconds = None;
    task.failure = None;
    let attempt = task.attempts;

    doc.record(
        EventKind::TaskStarted,
        Some(id),
        serde_json::json!({ "attempt": attempt }),
    );
    state::refresh_execution(doc);
    tracing::info!(task_id = id, attempt, "task started");
    Ok(())
}

/// `ready -> running` plus a snapshot of the files the task declares.
///
/// Any result file left by an earlier attempt is removed so recovery and
/// `checkpoint report` cannot mistake it for this attempt's outcome.
pub fn begin_attempt(doc: &mut Document, id: &str, planning_dir: &Path) -> Result<()> {
    start(doc, id)?;
    discard_stale_result(planning_dir, id)?;
    let target = std::path::PathBuf::from(&doc.target_dir);
    let snapshot = take_snapshot(planning_dir, &target, doc.task(id)?)?;
    doc.task_mut(id)?.snapshot = Some(snapshot);
    Ok(())
}

fn discard_stale_result(planning_dir: &Path, id: &str) -> Result<()> {
    let path = bundle::result_path(&planning_dir.join("bundles"), id);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(task_id = id, path = %path.display(), "removed stale result file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TaskerError::io(path, e)),
    }
}

fn finish_timing(task: &mut Task) {
    let now = Utc::now();
    task.completed_at = Some(now);
    task.duration_seconds = task
        .started_at
        .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
}

fn merge_files(task: &mut Task, touched: &FilesTouched) {
    for path in &touched.created {
        if !task.files_created.contains(path) {
            task.files_created.push(path.clone());
        }
    }
    for path in &touched.modified {
        if !task.files_modified.contains(path) {
            task.files_modified.push(path.clone());
        }
    }
}

/// `running -> complete`. Returns the dependents promoted to ready.
pub fn complete(doc: &mut Document, id: &str, touched: &FilesTouched) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    if task.status != TaskStatus::Running {
        return Err(reject(task, "complete"));
    }
    task.status = TaskStatus::Complete;
    finish_timing(task);
    merge_files(task, touched);
    let duration = task.duration_seconds;

    doc.execution.completed_count += 1;
    doc.record(
        EventKind::TaskCompleted,
        Some(id),
        serde_json::json!({
            "files_created": touched.created,
            "files_modified": touched.modified,
            "duration_seconds": duration,
        }),
    );
    let promoted = promote_dependents(doc, id);
    state::refresh_execution(doc);
    tracing::info!(task_id = id, promoted = promoted.len(), "task completed");
    Ok(promoted)
}

/// Promote direct dependents of `id` whose dependencies are now satisfied.
fn promote_dependents(doc: &mut Document, id: &str) -> Vec<String> {
    let mut promoted = Vec::new();
    for dependent in doc.dependents_of(id) {
        if doc.status_of(&dependent) == Some(TaskStatus::Pending)
            && doc.dependencies_satisfied(&dependent)
        {
            mark_ready(doc, &dependent);
            promoted.push(dependent);
        }
    }
    promoted
}

/// Block every non-terminal task downstream of `cause`, breadth first.
fn block_downstream(doc: &mut Document, cause: &str) -> Vec<String> {
    let mut blocked = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = doc.dependents_of(cause).into();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(task) = doc.tasks.get_mut(&id) else {
            continue;
        };
        if task.status.is_terminal() || task.status == TaskStatus::Running {
            continue;
        }
        task.blocked_by.insert(cause.to_string());
        if task.status != TaskStatus::Blocked {
            task.status = TaskStatus::Blocked;
            doc.record(
                EventKind::TaskBlocked,
                Some(&id),
                serde_json::json!({ "blocked_by": cause }),
            );
            blocked.push(id.clone());
        }
        queue.extend(doc.dependents_of(&id));
    }
    blocked
}

/// Remove `cause` from the blockers of everything downstream of it. Tasks
/// left with no blockers return to pending.
fn unblock_downstream(doc: &mut Document, cause: &str) -> Vec<String> {
    let mut released = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = doc.dependents_of(cause).into();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(task) = doc.tasks.get_mut(&id) else {
            continue;
        };
        if !task.blocked_by.remove(cause) {
            continue;
        }
        if task.blocked_by.is_empty() && task.status == TaskStatus::Blocked {
            task.status = TaskStatus::Pending;
            doc.record(
                EventKind::TaskUnblocked,
                Some(&id),
                serde_json::json!({ "released_by": cause }),
            );
            released.push(id.clone());
        }
        queue.extend(doc.dependents_of(&id));
    }
    released
}

fn mark_failed(doc: &mut Document, id: &str, failure: TaskFailure) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    task.status = TaskStatus::Failed;
    finish_timing(task);
    task.failure = Some(failure.clone());

    doc.execution.failed_count += 1;
    doc.record(
        EventKind::TaskFailed,
        Some(id),
        serde_json::json!({
            "category": failure.category,
            "message": failure.message,
            "retryable": failure.retryable,
        }),
    );
    let blocked = block_downstream(doc, id);
    state::refresh_execution(doc);
    tracing::warn!(task_id = id, category = %failure.category, blocked = blocked.len(), "task failed");
    Ok(blocked)
}

/// `running -> failed`, blocking every task downstream. Returns the ids
/// that became blocked.
pub fn fail(
    doc: &mut Document,
    id: &str,
    failure: TaskFailure,
    touched: &FilesTouched,
) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    if task.status != TaskStatus::Running {
        return Err(reject(task, "fail"));
    }
    merge_files(task, touched);
    mark_failed(doc, id, failure)
}

/// Fail a task that was never dispatched, e.g. when its inputs are missing.
pub fn fail_undispatched(doc: &mut Document, id: &str, failure: TaskFailure) -> Result<Vec<String>> {
    let task = doc.task(id)?;
    if !matches!(
        task.status,
        TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running
    ) {
        return Err(reject(task, "fail"));
    }
    mark_failed(doc, id, failure)
}

/// `fail` plus rollback of the attempt's file changes.
pub fn fail_attempt(
    doc: &mut Document,
    id: &str,
    failure: TaskFailure,
    touched: &FilesTouched,
    planning_dir: &Path,
) -> Result<FailureOutcome> {
    let blocked = fail(doc, id, failure, touched)?;
    let target = std::path::PathBuf::from(&doc.target_dir);
    let report = rollback(planning_dir, &target, doc.task(id)?)?;

    let task = doc.task_mut(id)?;
    task.files_created.clear();
    task.files_modified.clear();
    if !report.is_empty() {
        doc.record(
            EventKind::RollbackApplied,
            Some(id),
            serde_json::to_value(&report)?,
        );
        tracing::info!(task_id = id, deleted = report.deleted.len(), restored = report.restored.len(), "rollback applied");
    }
    Ok(FailureOutcome {
        blocked,
        rollback: report,
    })
}

/// `failed -> pending`. Tasks blocked only by this one return to pending.
///
/// A non-retryable failure needs `force`.
pub fn retry(doc: &mut Document, id: &str, force: bool) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    if task.status != TaskStatus::Failed {
        return Err(reject(task, "retry"));
    }
    if let Some(f) = &task.failure
        && !f.retryable
        && !force
    {
        return Err(TaskerError::invalid(format!(
            "task {} failed with non-retryable {} error; use --force to retry anyway",
            id, f.category
        )));
    }

    task.status = TaskStatus::Pending;
    task.attempts += 1;
    task.failure = None;
    task.started_at = None;
    task.completed_at = None;
    task.duration_seconds = None;
    let attempt = task.attempts;

    doc.execution.failed_count = doc.execution.failed_count.saturating_sub(1);
    doc.record(
        EventKind::TaskRetried,
        Some(id),
        serde_json::json!({ "attempt": attempt, "forced": force }),
    );
    let released = unblock_downstream(doc, id);
    state::refresh_execution(doc);
    tracing::info!(task_id = id, attempt, released = released.len(), "task retried");
    Ok(released)
}

/// `running -> pending` for a task whose worker went away without reporting.
/// The attempt's file changes are rolled back first.
pub fn requeue(doc: &mut Document, id: &str, planning_dir: &Path) -> Result<RollbackReport> {
    let task = doc.task(id)?;
    if task.status != TaskStatus::Running {
        return Err(reject(task, "requeue"));
    }
    let target = std::path::PathBuf::from(&doc.target_dir);
    let report = rollback(planning_dir, &target, task)?;

    let task = doc.task_mut(id)?;
    task.status = TaskStatus::Pending;
    task.attempts += 1;
    task.started_at = None;
    task.files_created.clear();
    task.files_modified.clear();
    if !report.is_empty() {
        doc.record(
            EventKind::RollbackApplied,
            Some(id),
            serde_json::to_value(&report)?,
        );
    }
    state::refresh_execution(doc);
    Ok(report)
}

/// Mark a task skipped. Skipping satisfies dependents the way completion does.
pub fn skip(doc: &mut Document, id: &str, reason: &str) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    if !matches!(
        task.status,
        TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Blocked | TaskStatus::Failed
    ) {
        return Err(reject(task, "skip"));
    }
    let was_failed = task.status == TaskStatus::Failed;
    task.status = TaskStatus::Skipped;
    task.skip_reason = Some(reason.to_string());
    task.blocked_by.clear();
    task.completed_at = Some(Utc::now());

    if was_failed {
        doc.execution.failed_count = doc.execution.failed_count.saturating_sub(1);
    }
    doc.record(
        EventKind::TaskSkipped,
        Some(id),
        serde_json::json!({ "reason": reason }),
    );
    unblock_downstream(doc, id);
    let promoted = promote_dependents(doc, id);
    state::refresh_execution(doc);
    tracing::info!(task_id = id, reason, "task skipped");
    Ok(promoted)
}

/// Record a verification verdict. A `fail` verdict on a completed task
/// blocks its dependents until a later passing verdict releases them.
pub fn record_verification(
    doc: &mut Document,
    id: &str,
    verification: Verification,
) -> Result<Vec<String>> {
    let task = doc.task_mut(id)?;
    if !matches!(
        task.status,
        TaskStatus::Running | TaskStatus::Complete | TaskStatus::Failed
    ) {
        return Err(reject(task, "verify"));
    }
    let status = task.status;
    let verdict = verification.verdict;
    task.verification = Some(verification);

    doc.record(
        EventKind::VerificationRecorded,
        Some(id),
        serde_json::json!({ "verdict": verdict }),
    );

    let changed = match (status, verdict) {
        (TaskStatus::Complete, Verdict::Fail) => block_downstream(doc, id),
        (TaskStatus::Complete, _) => {
            let mut released = unblock_downstream(doc, id);
            released.extend(promote_dependents(doc, id));
            released
        }
        _ => Vec::new(),
    };
    tracing::info!(task_id = id, ?verdict, affected = changed.len(), "verification recorded");
    Ok(changed)
}

/// Lifecycle operations bound to a repository; each call is one locked
/// read-modify-write.
pub struct TaskController<'a> {
    repo: &'a StateRepository,
}

impl<'a> TaskController<'a> {
    pub fn new(repo: &'a StateRepository) -> Self {
        Self { repo }
    }

    pub fn ready(&self) -> Result<Vec<Task>> {
        let doc = self.repo.load_required()?;
        Ok(ready_tasks(&doc).into_iter().cloned().collect())
    }

    pub fn start(&self, id: &str) -> Result<Task> {
        let planning = self.repo.planning_dir().to_path_buf();
        self.repo.update(|doc| {
            begin_attempt(doc, id, &planning)?;
            Ok(doc.task(id)?.clone())
        })
    }

    pub fn complete(&self, id: &str, touched: &FilesTouched) -> Result<Vec<String>> {
        self.repo.update(|doc| complete(doc, id, touched))
    }

    pub fn fail(
        &self,
        id: &str,
        failure: TaskFailure,
        touched: &FilesTouched,
    ) -> Result<FailureOutcome> {
        let planning = self.repo.planning_dir().to_path_buf();
        self.repo
            .update(|doc| fail_attempt(doc, id, failure, touched, &planning))
    }

    pub fn retry(&self, id: &str, force: bool) -> Result<Vec<String>> {
        self.repo.update(|doc| retry(doc, id, force))
    }

    pub fn skip(&self, id: &str, reason: &str) -> Result<Vec<String>> {
        self.repo.update(|doc| skip(doc, id, reason))
    }

    pub fn verify(&self, id: &str, verification: Verification) -> Result<Vec<String>> {
        self.repo
            .update(|doc| record_verification(doc, id, verification))
    }
}
