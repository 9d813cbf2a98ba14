//! Pre-attempt snapshots and rollback of a failed attempt's file changes.

use crate::errors::{Result, TaskerError};
use crate::state::{AttemptSnapshot, FileAction, Task};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub deleted: Vec<String>,
    pub restored: Vec<String>,
    /// Modified files with no snapshot copy to restore from.
    pub unrestorable: Vec<String>,
}

impl RollbackReport {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.restored.is_empty() && self.unrestorable.is_empty()
    }
}

/// Join a task-relative path onto `root`, refusing anything that escapes it.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(TaskerError::invalid(format!(
            "path '{}' must be relative and stay inside {}",
            relative,
            root.display()
        )));
    }
    Ok(root.join(rel))
}

/// Copy every declared file that exists now into
/// `<planning>/snapshots/<id>/<attempt>/` and note the ones that do not.
pub fn take_snapshot(planning_dir: &Path, target_dir: &Path, task: &Task) -> Result<AttemptSnapshot> {
    let rel_dir = format!("snapshots/{}/{}", task.id, task.attempts);
    let snap_dir = planning_dir.join(&rel_dir);
    if snap_dir.exists() {
        fs::remove_dir_all(&snap_dir).map_err(|e| TaskerError::io(&snap_dir, e))?;
    }

    let mut preserved = Vec::new();
    let mut absent = Vec::new();
    for spec in &task.files {
        let source = resolve_within(target_dir, &spec.path)?;
        if source.is_file() {
            let copy = snap_dir.join(&spec.path);
            if let Some(parent) = copy.parent() {
                fs::create_dir_all(parent).map_err(|e| TaskerError::io(parent, e))?;
            }
            fs::copy(&source, &copy).map_err(|e| TaskerError::io(&source, e))?;
            preserved.push(spec.path.clone());
        } else {
            if spec.action == FileAction::Modify {
                tracing::warn!(task_id = %task.id, path = %spec.path, "file declared as modified does not exist yet");
            }
            absent.push(spec.path.clone());
        }
    }

    tracing::debug!(task_id = %task.id, attempt = task.attempts, preserved = preserved.len(), "attempt snapshot taken");
    Ok(AttemptSnapshot {
        attempt: task.attempts,
        dir: rel_dir,
        preserved,
        absent,
    })
}

/// Undo the file effects of the task's last attempt.
///
/// Files the attempt created (reported, or declared and absent before the
/// attempt) are deleted. Files it modified are restored from the snapshot.
pub fn rollback(planning_dir: &Path, target_dir: &Path, task: &Task) -> Result<RollbackReport> {
    let mut report = RollbackReport::default();
    let snapshot = task.snapshot.as_ref();

    let mut created: Vec<&String> = task.files_created.iter().collect();
    if let Some(s) = snapshot {
        created.extend(s.absent.iter());
    }
    created.sort();
    created.dedup();

    for rel in created {
        if snapshot.is_some_and(|s| s.preserved.contains(rel)) {
            continue;
        }
        let path = resolve_within(target_dir, rel)?;
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| TaskerError::io(&path, e))?;
            report.deleted.push(rel.clone());
        }
    }

    let mut modified: Vec<&String> = task.files_modified.iter().collect();
    if let Some(s) = snapshot {
        modified.extend(s.preserved.iter());
    }
    modified.sort();
    modified.dedup();

    for rel in modified {
        let target = resolve_within(target_dir, rel)?;
        let copy = snapshot
            .filter(|s| s.preserved.contains(rel))
            .map(|s| planning_dir.join(&s.dir).join(rel));
        match copy {
            Some(copy) if copy.is_file() => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| TaskerError::io(parent, e))?;
                }
                fs::copy(&copy, &target).map_err(|e| TaskerError::io(&target, e))?;
                report.restored.push(rel.clone());
            }
            _ => {
                tracing::warn!(task_id = %task.id, path = %rel, "no snapshot copy to restore");
                report.unrestorable.push(rel.clone());
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileSpec;
    use tempfile::tempdir;

    fn task_with_files() -> Task {
        let mut task = Task::new("T1", "one");
        task.attempts = 1;
        task.files = vec![
            FileSpec {
                path: "src/new.rs".into(),
                action: FileAction::Create,
            },
            FileSpec {
                path: "src/lib.rs".into(),
                action: FileAction::Modify,
            },
        ];
        task
    }

    #[test]
    fn test_resolve_within_rejects_escapes() {
        let root = Path::new("/work");
        assert!(resolve_within(root, "src/a.rs").is_ok());
        assert!(resolve_within(root, "../etc/passwd").is_err());
        assert!(resolve_within(root, "/etc/passwd").is_err());
        assert!(resolve_within(root, "").is_err());
    }

    #[test]
    fn test_rollback_restores_modified_and_deletes_created() {
        let planning = tempdir().unwrap();
        let target = tempdir().unwrap();
        fs::create_dir_all(target.path().join("src")).unwrap();
        fs::write(target.path().join("src/lib.rs"), "original").unwrap();

        let mut task = task_with_files();
        let snapshot = take_snapshot(planning.path(), target.path(), &task).unwrap();
        assert_eq!(snapshot.preserved, vec!["src/lib.rs"]);
        assert_eq!(snapshot.absent, vec!["src/new.rs"]);
        task.snapshot = Some(snapshot);

        // the attempt
        fs::write(target.path().join("src/lib.rs"), "broken").unwrap();
        fs::write(target.path().join("src/new.rs"), "half done").unwrap();
        fs::write(target.path().join("scratch.txt"), "tmp").unwrap();
        task.files_created = vec!["scratch.txt".into()];

        let report = rollback(planning.path(), target.path(), &task).unwrap();
        assert_eq!(report.deleted, vec!["scratch.txt", "src/new.rs"]);
        assert_eq!(report.restored, vec!["src/lib.rs"]);
        assert_eq!(
            fs::read_to_string(target.path().join("src/lib.rs")).unwrap(),
            "original"
        );
        assert!(!target.path().join("src/new.rs").exists());
        assert!(!target.path().join("scratch.txt").exists());
    }

    #[test]
    fn test_rollback_without_snapshot_reports_unrestorable() {
        let planning = tempdir().unwrap();
        let target = tempdir().unwrap();
        let mut task = Task::new("T1", "one");
        task.files_modified = vec!["a.txt".into()];
        let report = rollback(planning.path(), target.path(), &task).unwrap();
        assert_eq!(report.unrestorable, vec!["a.txt"]);
        assert!(report.deleted.is_empty());
    }
}
