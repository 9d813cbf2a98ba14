//! Typed access to the orchestration document on disk.

use super::model::{Document, EventKind, SCHEMA_VERSION};
use crate::dag;
use crate::errors::{Result, TaskerError};
use crate::store::{self, DocumentStore, WriteDecision};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the document inside the planning directory.
pub const STATE_FILE: &str = "state.json";

/// Result of a `recover state` run.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Whether the journal had to be restored.
    pub restored: bool,
    /// Where the unreadable document was copied before restoring.
    pub backup: Option<PathBuf>,
    pub task_count: usize,
}

/// The orchestration document, always accessed through the locked store.
#[derive(Debug, Clone)]
pub struct StateRepository {
    planning_dir: PathBuf,
    store: DocumentStore,
}

enum Loaded {
    Missing,
    Ready(Document),
    Damaged(TaskerError),
}

impl StateRepository {
    pub fn new(planning_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let planning_dir = planning_dir.into();
        let store = DocumentStore::new(planning_dir.join(STATE_FILE), lock_timeout);
        Self {
            planning_dir,
            store,
        }
    }

    pub fn planning_dir(&self) -> &Path {
        &self.planning_dir
    }

    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.planning_dir.join("tasks")
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.planning_dir.join("bundles")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.planning_dir.join("snapshots")
    }

    pub fn exists(&self) -> bool {
        self.store.exists()
    }

    /// Create a fresh session. Refuses to overwrite an existing document.
    pub fn init(&self, target_dir: &str) -> Result<Document> {
        let path = self.state_path().to_path_buf();
        self.store.write_raw(|bytes| {
            if bytes.is_some() {
                return Err(TaskerError::SessionExists { path });
            }
            let doc = Document::new(target_dir);
            tracing::info!(target_dir, "session initialized");
            Ok(WriteDecision::Persist(store::encode(&doc)?, doc))
        })
    }

    /// Load the document. A missing file is `Ok(None)`, not an error.
    ///
    /// An unparseable or structurally invalid document is restored from the
    /// journal when possible; otherwise the corruption error is returned.
    pub fn load(&self) -> Result<Option<Document>> {
        let path = self.state_path().to_path_buf();
        let loaded = self.store.read_raw(|bytes| match bytes {
            None => Ok(Loaded::Missing),
            Some(b) => match decode(&path, b) {
                Ok(doc) => Ok(Loaded::Ready(doc)),
                Err(e) if is_damage(&e) => Ok(Loaded::Damaged(e)),
                Err(e) => Err(e),
            },
        })?;

        match loaded {
            Loaded::Missing => Ok(None),
            Loaded::Ready(doc) => Ok(Some(doc)),
            Loaded::Damaged(e) => {
                tracing::warn!(error = %e, "document unreadable, attempting journal recovery");
                let (doc, _) = self.repair()?;
                Ok(Some(doc))
            }
        }
    }

    /// Load the document, treating a missing session as an error.
    pub fn load_required(&self) -> Result<Document> {
        self.load()?.ok_or_else(|| TaskerError::NoSession {
            path: self.state_path().to_path_buf(),
        })
    }

    /// Validate and persist `doc` as-is.
    pub fn save(&self, doc: &Document) -> Result<()> {
        check(doc)?;
        let data = store::encode(doc)?;
        self.store
            .write_raw(|_| Ok(WriteDecision::Persist(data, ())))
    }

    /// Read-modify-write under one exclusive lock hold.
    ///
    /// The closure sees the freshly read document. If it fails, nothing is
    /// written. If it succeeds, the result is validated and persisted before
    /// the lock is released.
    pub fn update<R>(&self, f: impl FnOnce(&mut Document) -> Result<R>) -> Result<R> {
        let path = self.state_path().to_path_buf();
        self.store.write_raw(|bytes| {
            let bytes = bytes.ok_or_else(|| TaskerError::NoSession { path: path.clone() })?;
            let mut doc = match decode(&path, bytes) {
                Ok(doc) => doc,
                Err(e) if is_damage(&e) => self.restore_journal(bytes, &e)?.0,
                Err(e) => return Err(e),
            };
            let value = f(&mut doc)?;
            doc.updated_at = Some(Utc::now());
            check(&doc)?;
            Ok(WriteDecision::Persist(store::encode(&doc)?, value))
        })
    }

    /// Check the document and restore it from the journal if it is damaged.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let path = self.state_path().to_path_buf();
        let intact = self.store.read_raw(|bytes| {
            let bytes = bytes.ok_or_else(|| TaskerError::NoSession { path: path.clone() })?;
            match decode(&path, bytes) {
                Ok(doc) => Ok(Some(doc.tasks.len())),
                Err(e) if is_damage(&e) => Ok(None),
                Err(e) => Err(e),
            }
        })?;

        if let Some(task_count) = intact {
            return Ok(RecoveryReport {
                restored: false,
                backup: None,
                task_count,
            });
        }
        let (doc, backup) = self.repair()?;
        Ok(RecoveryReport {
            restored: true,
            backup,
            task_count: doc.tasks.len(),
        })
    }

    fn repair(&self) -> Result<(Document, Option<PathBuf>)> {
        let path = self.state_path().to_path_buf();
        self.store.write_raw(|bytes| {
            let bytes = bytes.ok_or_else(|| TaskerError::NoSession { path: path.clone() })?;
            // Another process may have repaired it while we waited for the lock.
            match decode(&path, bytes) {
                Ok(doc) => Ok(WriteDecision::Skip((doc, None))),
                Err(e) if is_damage(&e) => {
                    let (doc, backup) = self.restore_journal(bytes, &e)?;
                    let data = store::encode(&doc)?;
                    Ok(WriteDecision::Persist(data, (doc, Some(backup))))
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Must be called with the write lock held.
    fn restore_journal(&self, damaged: &[u8], cause: &TaskerError) -> Result<(Document, PathBuf)> {
        let journal_path = self.store.journal_path();
        let journal = match std::fs::read(journal_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskerError::Corrupt {
                    path: self.state_path().to_path_buf(),
                    message: format!("{}; no journal to restore from", cause),
                });
            }
            Err(e) => return Err(TaskerError::io(journal_path, e)),
        };

        let mut doc = decode(journal_path, &journal).map_err(|e| TaskerError::Corrupt {
            path: self.state_path().to_path_buf(),
            message: format!("{}; journal unusable: {}", cause, e),
        })?;

        let backup = backup_path(self.state_path());
        store::atomic_write(&backup, damaged)?;
        doc.record(
            EventKind::StateRecovered,
            None,
            serde_json::json!({
                "backup": backup.display().to_string(),
                "cause": cause.to_string(),
            }),
        );
        tracing::warn!(backup = %backup.display(), "document restored from journal");
        Ok((doc, backup))
    }
}

fn backup_path(state_path: &Path) -> PathBuf {
    let mut name = state_path.as_os_str().to_os_string();
    name.push(format!(".corrupted.{}", Utc::now().format("%Y%m%dT%H%M%S%3f")));
    PathBuf::from(name)
}

fn is_damage(err: &TaskerError) -> bool {
    matches!(err, TaskerError::Corrupt { .. } | TaskerError::InvalidDocument { .. })
}

/// Parse, version-check and validate raw document bytes.
fn decode(path: &Path, bytes: &[u8]) -> Result<Document> {
    let corrupt = |message: String| TaskerError::Corrupt {
        path: path.to_path_buf(),
        message,
    };
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    let found = value
        .get("version")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| corrupt("missing version field".to_string()))?;
    if found != SCHEMA_VERSION {
        return Err(TaskerError::MigrationRequired {
            found: found.to_string(),
            expected: SCHEMA_VERSION.to_string(),
        });
    }
    let doc: Document = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
    check(&doc)?;
    Ok(doc)
}

fn check(doc: &Document) -> Result<()> {
    let mut problems = validate(doc);
    if problems.is_empty() {
        return Ok(());
    }
    if problems.len() == 1 && matches!(problems[0], TaskerError::MigrationRequired { .. }) {
        return Err(problems.remove(0));
    }
    Err(TaskerError::InvalidDocument {
        problems: problems.iter().map(ToString::to_string).collect(),
    })
}

/// Structural validation: schema version, id uniqueness, referential
/// integrity, acyclicity and phase monotonicity. Returns every problem found.
pub fn validate(doc: &Document) -> Vec<TaskerError> {
    let mut problems = Vec::new();

    if doc.version != SCHEMA_VERSION {
        problems.push(TaskerError::MigrationRequired {
            found: doc.version.clone(),
            expected: SCHEMA_VERSION.to_string(),
        });
    }

    for (key, task) in &doc.tasks {
        if key != &task.id {
            problems.push(TaskerError::DuplicateTask {
                id: task.id.clone(),
            });
        }
        let mut seen = HashSet::new();
        for dep in &task.depends_on {
            if !seen.insert(dep.as_str()) {
                problems.push(TaskerError::invalid(format!(
                    "task {} lists dependency {} more than once",
                    task.id, dep
                )));
                continue;
            }
            match doc.tasks.get(dep) {
                None => problems.push(TaskerError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                }),
                Some(upstream) => {
                    if let (Some(own), Some(theirs)) = (task.phase, upstream.phase)
                        && own <= theirs
                    {
                        problems.push(TaskerError::invalid(format!(
                            "task {} in phase {} does not follow dependency {} in phase {}",
                            task.id, own, dep, theirs
                        )));
                    }
                }
            }
        }
    }

    if problems.is_empty()
        && let Some(path) = dag::find_cycle(doc.tasks.values())
    {
        problems.push(TaskerError::Cycle { path });
    }

    if let Some(cp) = &doc.checkpoint {
        let mut seen = HashSet::new();
        for slot in &cp.slots {
            if !doc.tasks.contains_key(&slot.task_id) {
                problems.push(TaskerError::CorruptCheckpoint {
                    batch_id: cp.batch_id.clone(),
                    message: format!("references unknown task {}", slot.task_id),
                });
            } else if !seen.insert(slot.task_id.as_str()) {
                problems.push(TaskerError::CorruptCheckpoint {
                    batch_id: cp.batch_id.clone(),
                    message: format!("lists task {} twice", slot.task_id),
                });
            }
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::Task;
    use std::fs;
    use tempfile::tempdir;

    fn repo(dir: &Path) -> StateRepository {
        StateRepository::new(dir, Duration::from_secs(5))
    }

    fn seeded(dir: &Path) -> StateRepository {
        let r = repo(dir);
        r.init("/work").unwrap();
        r.update(|doc| {
            doc.tasks.insert("T1".into(), Task::new("T1", "one").with_order(0));
            doc.tasks.insert(
                "T2".into(),
                Task::new("T2", "two").with_deps(&["T1"]).with_order(1),
            );
            Ok(())
        })
        .unwrap();
        r
    }

    #[test]
    fn test_load_missing_is_no_session() {
        let dir = tempdir().unwrap();
        let r = repo(dir.path());
        assert!(r.load().unwrap().is_none());
        let err = r.load_required().unwrap_err();
        assert!(matches!(err, TaskerError::NoSession { .. }));
    }

    #[test]
    fn test_init_refuses_existing_session() {
        let dir = tempdir().unwrap();
        let r = repo(dir.path());
        r.init("/work").unwrap();
        assert!(matches!(
            r.init("/work").unwrap_err(),
            TaskerError::SessionExists { .. }
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        let loaded = r.load_required().unwrap();
        r.save(&loaded).unwrap();
        let again = r.load_required().unwrap();
        assert_eq!(again, loaded);

        let first = fs::read(r.state_path()).unwrap();
        r.save(&again).unwrap();
        assert_eq!(fs::read(r.state_path()).unwrap(), first);
    }

    #[test]
    fn test_update_rejects_unknown_dependency() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        let err = r
            .update(|doc| {
                doc.tasks
                    .insert("T3".into(), Task::new("T3", "three").with_deps(&["T9"]));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, TaskerError::InvalidDocument { .. }));
        assert!(err.to_string().contains("T9"));
        assert!(!r.load_required().unwrap().tasks.contains_key("T3"));
    }

    #[test]
    fn test_validate_reports_cycle_and_phase_order() {
        let mut doc = Document::new("/work");
        doc.tasks
            .insert("A".into(), Task::new("A", "a").with_deps(&["B"]));
        doc.tasks
            .insert("B".into(), Task::new("B", "b").with_deps(&["A"]));
        let problems = validate(&doc);
        assert!(problems.iter().any(|p| matches!(p, TaskerError::Cycle { .. })));

        let mut doc = Document::new("/work");
        let mut a = Task::new("A", "a");
        a.phase = Some(2);
        let mut b = Task::new("B", "b").with_deps(&["A"]);
        b.phase = Some(2);
        doc.tasks.insert("A".into(), a);
        doc.tasks.insert("B".into(), b);
        let problems = validate(&doc);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].to_string().contains("does not follow"));
    }

    #[test]
    fn test_version_mismatch_requires_migration() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        let raw = fs::read_to_string(r.state_path()).unwrap();
        fs::write(r.state_path(), raw.replace("\"2.0\"", "\"1.0\"")).unwrap();
        let err = r.load().unwrap_err();
        assert!(matches!(err, TaskerError::MigrationRequired { .. }));
        assert_eq!(err.category(), "schema");
    }

    #[test]
    fn test_corrupt_document_restored_from_journal() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        fs::write(r.state_path(), b"{\"version\": \"2.0\", \"tasks\": {").unwrap();

        let doc = r.load_required().unwrap();
        assert_eq!(doc.tasks.len(), 2);
        assert!(doc
            .events
            .iter()
            .any(|e| e.kind == EventKind::StateRecovered));

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupted."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_corrupt_without_journal_is_fatal() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        fs::remove_file(dir.path().join("state.json.journal")).unwrap();
        fs::write(r.state_path(), b"garbage").unwrap();

        let err = r.load().unwrap_err();
        assert_eq!(err.category(), "corruption");
        assert_eq!(fs::read(r.state_path()).unwrap(), b"garbage");
    }

    #[test]
    fn test_recover_reports_intact_document() {
        let dir = tempdir().unwrap();
        let r = seeded(dir.path());
        let report = r.recover().unwrap();
        assert!(!report.restored);
        assert_eq!(report.task_count, 2);
    }
}
