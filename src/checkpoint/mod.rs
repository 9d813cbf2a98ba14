//! Checkpoint and recovery manager.
//!
//! Before a batch is dispatched concurrently, a checkpoint naming exactly
//! that batch is written and every member is started, all in one write.
//! Each reported outcome updates the member's slot and fires the lifecycle
//! transition in one write as well. The checkpoint is cleared once every
//! slot is terminal.
//!
//! Recovery runs before any new dispatch. Members whose outcome was
//! recorded but never acknowledged are reconciled; members still running
//! with a result file waiting are applied; members still running with no
//! result are orphans and need an operator decision.

use crate::bundle::{self, TaskResult, read_result};
use crate::errors::{Result, TaskerError};
use crate::lifecycle;
use crate::state::{
    Checkpoint, CheckpointSlot, Document, EventKind, SlotOutcome, StateRepository, TaskFailure,
    TaskStatus, halt,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// What to do with an orphaned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDecision {
    /// Roll back the attempt and reset the task to pending
    Retry,
    /// Record the attempt as failed
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub batch_id: String,
    pub task_id: String,
    pub outcome: SlotOutcome,
    /// Dependents promoted, blocked or released by the transition.
    pub affected: Vec<String>,
    pub cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub task_id: String,
    pub outcome: SlotOutcome,
    pub task_status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub slots: Vec<SlotView>,
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileSource {
    /// The task already had a terminal status.
    Status,
    /// A worker result file was applied.
    ResultFile,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciled {
    pub task_id: String,
    pub outcome: SlotOutcome,
    pub source: ReconcileSource,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRecovery {
    pub batch_id: Option<String>,
    pub reconciled: Vec<Reconciled>,
    pub orphans: Vec<String>,
    pub cleared: bool,
}

impl BatchRecovery {
    /// Surface orphans as the recovery error that demands a decision.
    pub fn into_result(self) -> Result<Self> {
        if self.orphans.is_empty() {
            Ok(self)
        } else {
            Err(TaskerError::Orphaned { ids: self.orphans })
        }
    }
}

fn settled_outcome(status: TaskStatus) -> Option<SlotOutcome> {
    match status {
        TaskStatus::Complete | TaskStatus::Skipped => Some(SlotOutcome::Complete),
        TaskStatus::Failed => Some(SlotOutcome::Failed),
        _ => None,
    }
}

fn active(doc: &Document) -> Result<&Checkpoint> {
    doc.checkpoint.as_ref().ok_or(TaskerError::NoCheckpoint)
}

fn set_slot(doc: &mut Document, task_id: &str, outcome: SlotOutcome) {
    let now = Utc::now();
    if let Some(cp) = doc.checkpoint.as_mut()
        && let Some(slot) = cp.slot_mut(task_id)
    {
        slot.outcome = outcome;
        slot.updated_at = Some(now);
        cp.updated_at = Some(now);
    }
}

fn clear_if_settled(doc: &mut Document) -> bool {
    if !doc.checkpoint.as_ref().is_some_and(Checkpoint::is_settled) {
        return false;
    }
    if let Some(cp) = doc.checkpoint.take() {
        doc.record(
            EventKind::CheckpointCleared,
            None,
            serde_json::json!({ "batch_id": cp.batch_id }),
        );
        tracing::info!(batch_id = %cp.batch_id, "checkpoint cleared");
    }
    true
}

/// Write a checkpoint for `batch` and start every member.
pub fn create(
    doc: &mut Document,
    batch: &[String],
    max_parallel: usize,
    planning_dir: &Path,
) -> Result<Checkpoint> {
    halt::ensure_dispatch_allowed(doc)?;
    if let Some(cp) = &doc.checkpoint {
        let pending = cp.pending();
        if !pending.is_empty() {
            return Err(TaskerError::CheckpointInFlight {
                batch_id: cp.batch_id.clone(),
                pending,
            });
        }
    }
    clear_if_settled(doc);

    if batch.is_empty() {
        return Err(TaskerError::invalid("a checkpoint needs at least one task"));
    }
    if batch.len() > max_parallel {
        return Err(TaskerError::invalid(format!(
            "batch of {} exceeds max_parallel {}",
            batch.len(),
            max_parallel
        )));
    }
    let mut seen = HashSet::new();
    for id in batch {
        if !seen.insert(id.as_str()) {
            return Err(TaskerError::invalid(format!("task {} listed twice in batch", id)));
        }
    }

    for id in batch {
        lifecycle::begin_attempt(doc, id, planning_dir)?;
    }

    let checkpoint = Checkpoint {
        batch_id: format!("batch-{}", Uuid::new_v4()),
        created_at: Utc::now(),
        updated_at: None,
        slots: batch
            .iter()
            .map(|id| CheckpointSlot {
                task_id: id.clone(),
                outcome: SlotOutcome::Pending,
                updated_at: None,
            })
            .collect(),
    };
    doc.record(
        EventKind::CheckpointCreated,
        None,
        serde_json::json!({ "batch_id": checkpoint.batch_id, "tasks": batch }),
    );
    tracing::info!(batch_id = %checkpoint.batch_id, tasks = batch.len(), "checkpoint created");
    doc.checkpoint = Some(checkpoint.clone());
    Ok(checkpoint)
}

/// Apply a worker result to a running task.
fn apply_result(
    doc: &mut Document,
    task_id: &str,
    result: &TaskResult,
    planning_dir: &Path,
) -> Result<(SlotOutcome, Vec<String>)> {
    if result.task_id != task_id {
        return Err(TaskerError::invalid(format!(
            "result is for task {}, not {}",
            result.task_id, task_id
        )));
    }
    match result.status {
        bundle::ResultStatus::Success => {
            let mut affected = lifecycle::complete(doc, task_id, &result.files)?;
            if let Some(verification) = result.verification() {
                affected.extend(lifecycle::record_verification(doc, task_id, verification)?);
            }
            Ok((SlotOutcome::Complete, affected))
        }
        bundle::ResultStatus::Failed => {
            let outcome = lifecycle::fail_attempt(
                doc,
                task_id,
                result.failure(),
                &result.files,
                planning_dir,
            )?;
            Ok((SlotOutcome::Failed, outcome.blocked))
        }
    }
}

/// Record one member's outcome: slot update, status transition and events
/// all land in the caller's single write.
pub fn report(
    doc: &mut Document,
    task_id: &str,
    result: &TaskResult,
    planning_dir: &Path,
) -> Result<ReportOutcome> {
    let cp = active(doc)?;
    let batch_id = cp.batch_id.clone();
    let slot = cp.slot(task_id).ok_or_else(|| {
        TaskerError::invalid(format!("task {} is not part of checkpoint {}", task_id, batch_id))
    })?;
    if slot.outcome.is_terminal() {
        return Err(TaskerError::invalid(format!(
            "task {} already reported to checkpoint {}",
            task_id, batch_id
        )));
    }

    let (outcome, affected) = apply_result(doc, task_id, result, planning_dir)?;
    set_slot(doc, task_id, outcome);
    doc.record(
        EventKind::CheckpointUpdated,
        Some(task_id),
        serde_json::json!({ "batch_id": batch_id, "outcome": outcome }),
    );
    let cleared = clear_if_settled(doc);
    Ok(ReportOutcome {
        batch_id,
        task_id: task_id.to_string(),
        outcome,
        affected,
        cleared,
    })
}

pub fn inspect(doc: &Document) -> Result<Inspection> {
    let cp = active(doc)?;
    let slots = cp
        .slots
        .iter()
        .map(|s| {
            Ok(SlotView {
                task_id: s.task_id.clone(),
                outcome: s.outcome,
                task_status: doc.task(&s.task_id)?.status,
                updated_at: s.updated_at,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Inspection {
        batch_id: cp.batch_id.clone(),
        created_at: cp.created_at,
        slots,
        pending: cp.pending(),
    })
}

/// Acknowledge members whose tasks already reached a terminal status, then
/// clear the checkpoint. Fails while any member is still unresolved.
pub fn finalize(doc: &mut Document) -> Result<String> {
    let cp = active(doc)?.clone();
    for slot in cp.slots.iter().filter(|s| !s.outcome.is_terminal()) {
        if let Some(outcome) = settled_outcome(doc.task(&slot.task_id)?.status) {
            set_slot(doc, &slot.task_id, outcome);
        }
    }
    let pending = active(doc)?.pending();
    if !pending.is_empty() {
        return Err(TaskerError::CheckpointInFlight {
            batch_id: cp.batch_id,
            pending,
        });
    }
    clear_if_settled(doc);
    Ok(cp.batch_id)
}

/// Drop the checkpoint. Without `force` every slot must be terminal.
pub fn clear(doc: &mut Document, force: bool) -> Result<String> {
    let cp = active(doc)?;
    let batch_id = cp.batch_id.clone();
    let pending = cp.pending();
    if !pending.is_empty() && !force {
        return Err(TaskerError::CheckpointInFlight { batch_id, pending });
    }
    doc.checkpoint = None;
    doc.record(
        EventKind::CheckpointCleared,
        None,
        serde_json::json!({ "batch_id": batch_id, "forced": force, "pending": pending }),
    );
    if force && !pending.is_empty() {
        tracing::warn!(batch_id = %batch_id, ?pending, "checkpoint force-cleared with pending members");
    }
    Ok(batch_id)
}

/// Reconcile the active checkpoint after a crash.
///
/// Orphans are reported, never retried here: the worker may have finished
/// its side effects without reporting.
pub fn recover(doc: &mut Document, bundles_dir: &Path, planning_dir: &Path) -> Result<BatchRecovery> {
    let Some(cp) = doc.checkpoint.clone() else {
        return Ok(BatchRecovery::default());
    };
    let mut recovery = BatchRecovery {
        batch_id: Some(cp.batch_id.clone()),
        ..BatchRecovery::default()
    };

    for slot in cp.slots.iter().filter(|s| !s.outcome.is_terminal()) {
        let id = slot.task_id.as_str();
        let status = doc
            .task(id)
            .map_err(|_| TaskerError::CorruptCheckpoint {
                batch_id: cp.batch_id.clone(),
                message: format!("references unknown task {}", id),
            })?
            .status;

        if let Some(outcome) = settled_outcome(status) {
            set_slot(doc, id, outcome);
            recovery.reconciled.push(Reconciled {
                task_id: id.to_string(),
                outcome,
                source: ReconcileSource::Status,
            });
            continue;
        }

        if status != TaskStatus::Running {
            set_slot(doc, id, SlotOutcome::Requeued);
            recovery.reconciled.push(Reconciled {
                task_id: id.to_string(),
                outcome: SlotOutcome::Requeued,
                source: ReconcileSource::Status,
            });
            continue;
        }

        let path = bundle::result_path(bundles_dir, id);
        let result = read_result(&path, id).map_err(|e| TaskerError::CorruptCheckpoint {
            batch_id: cp.batch_id.clone(),
            message: e.to_string(),
        })?;
        match result {
            Some(result) => {
                let (outcome, _) = apply_result(doc, id, &result, planning_dir)?;
                set_slot(doc, id, outcome);
                recovery.reconciled.push(Reconciled {
                    task_id: id.to_string(),
                    outcome,
                    source: ReconcileSource::ResultFile,
                });
            }
            None => recovery.orphans.push(id.to_string()),
        }
    }

    if !recovery.reconciled.is_empty() || !recovery.orphans.is_empty() {
        doc.record(
            EventKind::RecoveryReconciled,
            None,
            serde_json::json!({
                "batch_id": cp.batch_id,
                "reconciled": recovery.reconciled,
                "orphans": recovery.orphans,
            }),
        );
    }
    for orphan in &recovery.orphans {
        tracing::warn!(batch_id = %cp.batch_id, task_id = %orphan, "orphaned task needs a decision");
    }
    recovery.cleared = clear_if_settled(doc);
    tracing::info!(
        batch_id = %cp.batch_id,
        reconciled = recovery.reconciled.len(),
        orphans = recovery.orphans.len(),
        "recovery finished"
    );
    Ok(recovery)
}

/// Apply an operator decision to an orphaned checkpoint member.
pub fn resolve_orphan(
    doc: &mut Document,
    task_id: &str,
    decision: OrphanDecision,
    planning_dir: &Path,
) -> Result<SlotOutcome> {
    let cp = active(doc)?;
    let batch_id = cp.batch_id.clone();
    let pending = cp.slot(task_id).is_some_and(|s| !s.outcome.is_terminal());
    if !pending || doc.task(task_id)?.status != TaskStatus::Running {
        return Err(TaskerError::invalid(format!(
            "task {} is not an orphan of checkpoint {}",
            task_id, batch_id
        )));
    }

    let outcome = match decision {
        OrphanDecision::Retry => {
            lifecycle::requeue(doc, task_id, planning_dir)?;
            SlotOutcome::Requeued
        }
        OrphanDecision::Fail => {
            let failure = TaskFailure {
                category: "orphaned".to_string(),
                message: "worker exited without reporting a result".to_string(),
                retryable: true,
            };
            lifecycle::fail_attempt(
                doc,
                task_id,
                failure,
                &lifecycle::FilesTouched::default(),
                planning_dir,
            )?;
            SlotOutcome::Failed
        }
    };
    set_slot(doc, task_id, outcome);
    doc.record(
        EventKind::OrphanResolved,
        Some(task_id),
        serde_json::json!({ "batch_id": batch_id, "decision": decision }),
    );
    tracing::info!(task_id, ?decision, "orphan resolved");
    clear_if_settled(doc);
    Ok(outcome)
}

/// Checkpoint operations bound to a repository, one locked write each.
pub struct CheckpointManager<'a> {
    repo: &'a StateRepository,
    max_parallel: usize,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(repo: &'a StateRepository, max_parallel: usize) -> Self {
        Self { repo, max_parallel }
    }

    pub fn create(&self, batch: &[String]) -> Result<Checkpoint> {
        let planning = self.repo.planning_dir().to_path_buf();
        self.repo
            .update(|doc| create(doc, batch, self.max_parallel, &planning))
    }

    /// Report from the task's result file, or from `result_file` if given.
    pub fn report_from_file(&self, task_id: &str, result_file: Option<&Path>) -> Result<ReportOutcome> {
        let path = match result_file {
            Some(p) => p.to_path_buf(),
            None => bundle::result_path(&self.repo.bundles_dir(), task_id),
        };
        let result = read_result(&path, task_id)?.ok_or_else(|| {
            TaskerError::invalid(format!("no result file at {}", path.display()))
        })?;
        self.report(task_id, &result)
    }

    pub fn report(&self, task_id: &str, result: &TaskResult) -> Result<ReportOutcome> {
        let planning = self.repo.planning_dir().to_path_buf();
        self.repo
            .update(|doc| report(doc, task_id, result, &planning))
    }

    pub fn inspect(&self) -> Result<Inspection> {
        inspect(&self.repo.load_required()?)
    }

    pub fn finalize(&self) -> Result<String> {
        self.repo.update(finalize)
    }

    pub fn clear(&self, force: bool) -> Result<String> {
        self.repo.update(|doc| clear(doc, force))
    }

    pub fn recover(&self) -> Result<BatchRecovery> {
        let planning = self.repo.planning_dir().to_path_buf();
        let bundles = self.repo.bundles_dir();
        self.repo.update(|doc| recover(doc, &bundles, &planning))
    }

    pub fn resolve(&self, task_id: &str, decision: OrphanDecision) -> Result<SlotOutcome> {
        let planning = self.repo.planning_dir().to_path_buf();
        self.repo
            .update(|doc| resolve_orphan(doc, task_id, decision, &planning))
    }
}
