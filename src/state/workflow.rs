//! Named workflow phases of a planning session.

use super::model::{Document, EventKind, TaskStatus, WorkflowPhase};
use crate::errors::{Result, TaskerError};

/// Move the session to the next workflow phase.
pub fn advance(doc: &mut Document) -> Result<WorkflowPhase> {
    let current = doc.phase.current;
    let next = current.next().ok_or_else(|| {
        TaskerError::invalid(format!("workflow is already in its final phase ({})", current))
    })?;

    if current == WorkflowPhase::Executing {
        let mut unfinished: Vec<_> = doc
            .tasks
            .values()
            .filter(|t| !matches!(t.status, TaskStatus::Complete | TaskStatus::Skipped))
            .collect();
        unfinished.sort_by_key(|t| t.sort_key());
        if !unfinished.is_empty() {
            let ids: Vec<&str> = unfinished.iter().map(|t| t.id.as_str()).collect();
            return Err(TaskerError::invalid(format!(
                "cannot leave executing: unfinished task(s) {}",
                ids.join(", ")
            )));
        }
    }

    doc.phase.completed.push(current);
    doc.phase.current = next;
    doc.record(
        EventKind::PhaseAdvanced,
        None,
        serde_json::json!({ "from": current, "to": next }),
    );
    tracing::info!(from = %current, to = %next, "workflow phase advanced");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::Task;

    #[test]
    fn test_advance_walks_order_and_records_history() {
        let mut doc = Document::new("/work");
        assert_eq!(advance(&mut doc).unwrap(), WorkflowPhase::SpecReview);
        assert_eq!(advance(&mut doc).unwrap(), WorkflowPhase::Logical);
        assert_eq!(
            doc.phase.completed,
            vec![WorkflowPhase::Ingestion, WorkflowPhase::SpecReview]
        );
        assert_eq!(
            doc.events.last().map(|e| e.kind),
            Some(EventKind::PhaseAdvanced)
        );
    }

    #[test]
    fn test_leaving_executing_requires_finished_tasks() {
        let mut doc = Document::new("/work");
        doc.phase.current = WorkflowPhase::Executing;
        doc.tasks.insert("T1".into(), Task::new("T1", "one"));
        let err = advance(&mut doc).unwrap_err();
        assert!(err.to_string().contains("T1"));

        doc.task_mut("T1").unwrap().status = TaskStatus::Skipped;
        assert_eq!(advance(&mut doc).unwrap(), WorkflowPhase::Complete);
        assert!(advance(&mut doc).is_err());
    }
}
