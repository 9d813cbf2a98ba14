//! Execution counters, usage accounting and the status report.

use super::model::{Document, EventKind, TaskStatus, WorkflowPhase};
use crate::errors::{Result, TaskerError};
use serde::Serialize;
use std::collections::BTreeMap;

/// Recompute `current_phase` and `active_tasks` from task statuses.
pub fn refresh_execution(doc: &mut Document) {
    let unfinished_phase = doc
        .tasks
        .values()
        .filter(|t| !t.status.is_terminal())
        .filter_map(|t| t.phase)
        .min();
    let last_phase = doc.tasks.values().filter_map(|t| t.phase).max();
    doc.execution.current_phase = unfinished_phase.or(last_phase).unwrap_or(0);

    let mut running: Vec<_> = doc
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Running)
        .collect();
    running.sort_by_key(|t| t.sort_key());
    doc.execution.active_tasks = running.into_iter().map(|t| t.id.clone()).collect();
}

/// Token usage reported by a worker for one task.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub model: Option<String>,
}

pub fn log_tokens(doc: &mut Document, task_id: &str, usage: &Usage) -> Result<()> {
    doc.task(task_id)?;
    if !usage.cost_usd.is_finite() || usage.cost_usd < 0.0 {
        return Err(TaskerError::invalid(format!(
            "cost must be a non-negative number, got {}",
            usage.cost_usd
        )));
    }
    let total = usage
        .input_tokens
        .checked_add(usage.output_tokens)
        .and_then(|t| doc.execution.total_tokens.checked_add(t).map(|sum| (t, sum)));
    let Some((total, running)) = total else {
        return Err(TaskerError::invalid(format!(
            "token count overflows: {} input + {} output on top of {} logged",
            usage.input_tokens, usage.output_tokens, doc.execution.total_tokens
        )));
    };
    doc.execution.total_tokens = running;
    doc.execution.total_cost_usd += usage.cost_usd;
    doc.record(
        EventKind::TokensLogged,
        Some(task_id),
        serde_json::json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cost_usd": usage.cost_usd,
            "model": usage.model,
        }),
    );
    tracing::debug!(task_id, total, cost = usage.cost_usd, "tokens logged");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub batch_id: String,
    pub tasks: Vec<String>,
    pub pending: Vec<String>,
}

/// Aggregate view of a session, printed by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub workflow_phase: WorkflowPhase,
    pub target_dir: String,
    pub total: usize,
    pub done: usize,
    pub counts: BTreeMap<String, usize>,
    pub ready: Vec<String>,
    pub active: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub current_phase: u32,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub halted: bool,
    pub steel_thread: Vec<String>,
    pub checkpoint: Option<CheckpointSummary>,
}

impl StatusReport {
    pub fn from_document(doc: &Document) -> Self {
        let mut counts = BTreeMap::new();
        for status in TaskStatus::ALL {
            counts.insert(status.to_string(), doc.count_by_status(status));
        }
        let ids_with = |status: TaskStatus| {
            let mut tasks: Vec<_> = doc.tasks.values().filter(|t| t.status == status).collect();
            tasks.sort_by_key(|t| t.sort_key());
            tasks.into_iter().map(|t| t.id.clone()).collect::<Vec<_>>()
        };

        let done = doc
            .tasks
            .values()
            .filter(|t| t.status.satisfies_dependency())
            .count();

        Self {
            workflow_phase: doc.phase.current,
            target_dir: doc.target_dir.clone(),
            total: doc.tasks.len(),
            done,
            counts,
            ready: crate::lifecycle::ready_tasks(doc)
                .into_iter()
                .map(|t| t.id.clone())
                .collect(),
            active: ids_with(TaskStatus::Running),
            failed: ids_with(TaskStatus::Failed),
            blocked: ids_with(TaskStatus::Blocked),
            current_phase: doc.execution.current_phase,
            total_tokens: doc.execution.total_tokens,
            total_cost_usd: doc.execution.total_cost_usd,
            halted: doc.halt_requested(),
            steel_thread: doc.steel_thread.clone(),
            checkpoint: doc.checkpoint.as_ref().map(|cp| CheckpointSummary {
                batch_id: cp.batch_id.clone(),
                tasks: cp.slots.iter().map(|s| s.task_id.clone()).collect(),
                pending: cp.pending(),
            }),
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.done as f64 * 100.0 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::Task;

    fn doc() -> Document {
        let mut doc = Document::new("/work");
        for (i, (id, status, phase)) in [
            ("T1", TaskStatus::Complete, 1),
            ("T2", TaskStatus::Running, 2),
            ("T3", TaskStatus::Pending, 2),
            ("T4", TaskStatus::Pending, 3),
        ]
        .into_iter()
        .enumerate()
        {
            let mut t = Task::new(id, id).with_order(i);
            t.status = status;
            t.phase = Some(phase);
            doc.tasks.insert(id.into(), t);
        }
        doc.task_mut("T4").unwrap().depends_on = vec!["T2".into()];
        doc
    }

    #[test]
    fn test_refresh_execution_tracks_lowest_unfinished_phase() {
        let mut d = doc();
        refresh_execution(&mut d);
        assert_eq!(d.execution.current_phase, 2);
        assert_eq!(d.execution.active_tasks, vec!["T2"]);

        for id in ["T2", "T3", "T4"] {
            d.task_mut(id).unwrap().status = TaskStatus::Complete;
        }
        refresh_execution(&mut d);
        assert_eq!(d.execution.current_phase, 3);
        assert!(d.execution.active_tasks.is_empty());
    }

    #[test]
    fn test_log_tokens_accumulates() {
        let mut d = doc();
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 500,
            cost_usd: 0.25,
            model: Some("worker".into()),
        };
        log_tokens(&mut d, "T2", &usage).unwrap();
        log_tokens(&mut d, "T2", &usage).unwrap();
        assert_eq!(d.execution.total_tokens, 3000);
        assert!((d.execution.total_cost_usd - 0.5).abs() < f64::EPSILON);
        assert!(log_tokens(&mut d, "nope", &usage).is_err());
    }

    #[test]
    fn test_log_tokens_rejects_overflow() {
        let mut d = doc();
        let mut usage = Usage {
            input_tokens: u64::MAX,
            output_tokens: 1,
            cost_usd: 0.0,
            model: None,
        };
        let err = log_tokens(&mut d, "T2", &usage).unwrap_err();
        assert_eq!(err.category(), "validation");
        assert_eq!(d.execution.total_tokens, 0);
        assert!(d.events.is_empty());

        // Each entry fits on its own, but the running total would wrap.
        usage.output_tokens = 0;
        log_tokens(&mut d, "T2", &usage).unwrap();
        usage.input_tokens = 1;
        assert!(log_tokens(&mut d, "T2", &usage).is_err());
        assert_eq!(d.execution.total_tokens, u64::MAX);
    }

    #[test]
    fn test_status_report_counts_and_ready() {
        let report = StatusReport::from_document(&doc());
        assert_eq!(report.total, 4);
        assert_eq!(report.done, 1);
        assert_eq!(report.counts["pending"], 2);
        assert_eq!(report.ready, vec!["T3"]);
        assert_eq!(report.active, vec!["T2"]);
        assert!((report.progress_percent() - 25.0).abs() < f64::EPSILON);
    }
}
