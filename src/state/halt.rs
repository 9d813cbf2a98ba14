//! Cooperative halt flag.
//!
//! A halt never interrupts a running worker. It only stops new dispatch; the
//! coordinator confirms the halt once the active batch has settled.

use super::model::{Document, EventKind, HaltInfo, TaskStatus};
use crate::errors::{Result, TaskerError};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HaltConfirmation {
    pub reason: Option<String>,
    /// Tasks still marked running when the halt took effect.
    pub running: Vec<String>,
}

pub fn request(doc: &mut Document, reason: &str, requested_by: &str) -> Result<()> {
    if doc.halt_requested() {
        return Err(TaskerError::invalid("halt already requested"));
    }
    doc.halt = Some(HaltInfo {
        requested: true,
        reason: Some(reason.to_string()),
        requested_by: Some(requested_by.to_string()),
        requested_at: Some(Utc::now()),
        halted_at: None,
    });
    doc.record(
        EventKind::HaltRequested,
        None,
        serde_json::json!({ "reason": reason, "requested_by": requested_by }),
    );
    tracing::info!(reason, requested_by, "halt requested");
    Ok(())
}

/// Error out if a halt blocks new dispatch.
pub fn ensure_dispatch_allowed(doc: &Document) -> Result<()> {
    match &doc.halt {
        Some(h) if h.requested => Err(TaskerError::Halted {
            reason: h.reason.clone().unwrap_or_else(|| "no reason given".into()),
        }),
        _ => Ok(()),
    }
}

/// Mark the session halted once the active checkpoint has settled.
pub fn confirm(doc: &mut Document) -> Result<HaltConfirmation> {
    if !doc.halt_requested() {
        return Err(TaskerError::invalid("no halt has been requested"));
    }
    if let Some(cp) = &doc.checkpoint {
        let pending = cp.pending();
        if !pending.is_empty() {
            return Err(TaskerError::CheckpointInFlight {
                batch_id: cp.batch_id.clone(),
                pending,
            });
        }
    }

    let mut running: Vec<_> = doc
        .tasks
        .values()
        .filter(|t| t.status == TaskStatus::Running)
        .collect();
    running.sort_by_key(|t| t.sort_key());
    let running: Vec<String> = running.into_iter().map(|t| t.id.clone()).collect();

    let reason = doc.halt.as_ref().and_then(|h| h.reason.clone());
    if let Some(h) = doc.halt.as_mut() {
        h.halted_at = Some(Utc::now());
    }
    doc.record(
        EventKind::HaltConfirmed,
        None,
        serde_json::json!({ "running": running }),
    );
    Ok(HaltConfirmation { reason, running })
}

/// Clear the halt flag. Returns false if no halt was set.
pub fn resume(doc: &mut Document) -> bool {
    if !doc.halt_requested() {
        return false;
    }
    doc.halt = None;
    doc.record(EventKind::ExecutionResumed, None, serde_json::Value::Null);
    tracing::info!("execution resumed");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{Checkpoint, CheckpointSlot, SlotOutcome};

    #[test]
    fn test_request_blocks_dispatch_until_resume() {
        let mut doc = Document::new("/work");
        request(&mut doc, "budget", "operator").unwrap();
        let err = ensure_dispatch_allowed(&doc).unwrap_err();
        assert!(err.to_string().contains("budget"));
        assert!(request(&mut doc, "again", "operator").is_err());

        assert!(resume(&mut doc));
        assert!(ensure_dispatch_allowed(&doc).is_ok());
        assert!(!resume(&mut doc));
    }

    #[test]
    fn test_confirm_waits_for_checkpoint() {
        let mut doc = Document::new("/work");
        doc.tasks
            .insert("T1".into(), crate::state::model::Task::new("T1", "one"));
        doc.checkpoint = Some(Checkpoint {
            batch_id: "b1".into(),
            created_at: Utc::now(),
            updated_at: None,
            slots: vec![CheckpointSlot {
                task_id: "T1".into(),
                outcome: SlotOutcome::Pending,
                updated_at: None,
            }],
        });
        request(&mut doc, "stop", "operator").unwrap();
        let err = confirm(&mut doc).unwrap_err();
        assert!(matches!(err, TaskerError::CheckpointInFlight { .. }));

        doc.checkpoint = None;
        let confirmation = confirm(&mut doc).unwrap();
        assert_eq!(confirmation.reason.as_deref(), Some("stop"));
        assert!(doc.halt.as_ref().unwrap().halted_at.is_some());
    }

    #[test]
    fn test_confirm_without_request_fails() {
        let mut doc = Document::new("/work");
        assert!(confirm(&mut doc).is_err());
    }
}
