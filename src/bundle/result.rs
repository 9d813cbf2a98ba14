//! Result files written by workers when a task attempt ends.

use crate::errors::{Result, TaskerError};
use crate::lifecycle::FilesTouched;
use crate::state::{CriterionResult, TaskFailure, Verdict, Verification};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const RESULT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultVerification {
    pub verdict: Verdict,
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    #[serde(default = "default_category")]
    pub category: String,
    pub message: String,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_category() -> String {
    "execution".to_string()
}

fn default_retryable() -> bool {
    true
}

fn default_version() -> String {
    RESULT_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default = "default_version")]
    pub version: String,
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub files: FilesTouched,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<ResultVerification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
}

impl TaskResult {
    pub fn success(task_id: &str, files: FilesTouched) -> Self {
        Self {
            version: RESULT_VERSION.to_string(),
            task_id: task_id.to_string(),
            status: ResultStatus::Success,
            files,
            verification: None,
            error: None,
        }
    }

    pub fn failed(task_id: &str, error: ResultError) -> Self {
        Self {
            version: RESULT_VERSION.to_string(),
            task_id: task_id.to_string(),
            status: ResultStatus::Failed,
            files: FilesTouched::default(),
            verification: None,
            error: Some(error),
        }
    }

    /// The failure to record for a failed result.
    pub fn failure(&self) -> TaskFailure {
        match &self.error {
            Some(e) => TaskFailure {
                category: e.category.clone(),
                message: e.message.clone(),
                retryable: e.retryable,
            },
            None => TaskFailure {
                category: default_category(),
                message: "worker reported failure without detail".to_string(),
                retryable: true,
            },
        }
    }

    pub fn verification(&self) -> Option<Verification> {
        self.verification.as_ref().map(|v| Verification {
            verdict: v.verdict,
            criteria: v.criteria.clone(),
            verified_at: Utc::now(),
        })
    }
}

/// Read a result file. A missing file is `Ok(None)`.
pub fn read_result(path: &Path, task_id: &str) -> Result<Option<TaskResult>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TaskerError::io(path, e)),
    };
    let result: TaskResult = serde_json::from_slice(&bytes).map_err(|e| {
        TaskerError::invalid(format!("result file {} is malformed: {}", path.display(), e))
    })?;
    if result.task_id != task_id {
        return Err(TaskerError::invalid(format!(
            "result file {} is for task {}, expected {}",
            path.display(),
            result.task_id,
            task_id
        )));
    }
    Ok(Some(result))
}
