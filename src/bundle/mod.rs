//! Execution bundles and the integrity validator.
//!
//! A bundle records a SHA-256 checksum of every upstream file a task reads
//! at the moment the bundle is prepared. Right before dispatch the checksums
//! are recomputed:
//!
//! - a changed file is drift: the bundle is regenerated with the new
//!   checksums and dispatch goes ahead
//! - a missing file fails the task with a non-retryable `dependency` error

mod result;

pub use result::{
    RESULT_VERSION, ResultError, ResultStatus, ResultVerification, TaskResult, read_result,
};

use crate::errors::{Result, TaskerError};
use crate::lifecycle::{self, resolve_within};
use crate::state::{Document, EventKind, FileAction, FileSpec, TaskFailure, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const BUNDLE_VERSION: &str = "1.0";

/// Failure category recorded when an upstream artifact is missing.
pub const DEPENDENCY_CATEGORY: &str = "dependency";

pub fn bundle_path(bundles_dir: &Path, task_id: &str) -> PathBuf {
    bundles_dir.join(format!("{}-bundle.json", task_id))
}

pub fn result_path(bundles_dir: &Path, task_id: &str) -> PathBuf {
    bundles_dir.join(format!("{}-result.json", task_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFile {
    pub path: String,
    pub checksum: String,
    /// Task that produced the file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub version: String,
    pub task_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    pub target_dir: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub dependency_files: Vec<DependencyFile>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftedFile {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Valid,
    Drift,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub task_id: String,
    pub status: IntegrityStatus,
    pub drifted: Vec<DriftedFile>,
    pub missing: Vec<String>,
    /// Whether the bundle was rewritten with fresh checksums.
    pub regenerated: bool,
}

impl IntegrityReport {
    /// Turn a missing-artifact report into the integrity error.
    pub fn into_result(self) -> Result<Self> {
        if self.status == IntegrityStatus::Missing {
            return Err(TaskerError::MissingDependency {
                task_id: self.task_id,
                paths: self.missing,
            });
        }
        Ok(self)
    }
}

/// SHA-256 of a file as lowercase hex.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| TaskerError::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| TaskerError::io(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Upstream files a task reads: what its dependencies created, then its own
/// declared reads. A dependency that reported nothing falls back to the
/// files it declared as created.
pub fn dependency_files(doc: &Document, task_id: &str) -> Result<Vec<(String, Option<String>)>> {
    let task = doc.task(task_id)?;
    let mut files: Vec<(String, Option<String>)> = Vec::new();
    let mut push = |path: &str, from: Option<&str>| {
        if !files.iter().any(|(p, _)| p == path) {
            files.push((path.to_string(), from.map(str::to_string)));
        }
    };

    for dep_id in &task.depends_on {
        let dep = doc.task(dep_id)?;
        if dep.status == TaskStatus::Skipped {
            continue;
        }
        if dep.files_created.is_empty() {
            for spec in dep.files.iter().filter(|f| f.action == FileAction::Create) {
                push(&spec.path, Some(dep_id));
            }
        } else {
            for path in &dep.files_created {
                push(path, Some(dep_id));
            }
        }
    }
    for path in &task.reads {
        push(path, None);
    }
    Ok(files)
}

fn checksum_all(
    target_dir: &Path,
    files: &[(String, Option<String>)],
) -> Result<(Vec<DependencyFile>, Vec<String>)> {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for (rel, from) in files {
        let path = resolve_within(target_dir, rel)?;
        if path.is_file() {
            present.push(DependencyFile {
                path: rel.clone(),
                checksum: checksum_file(&path)?,
                from_task: from.clone(),
            });
        } else {
            missing.push(rel.clone());
        }
    }
    Ok((present, missing))
}

/// Build the bundle for a task from the current document and files on disk.
pub fn build(doc: &Document, task_id: &str) -> Result<Bundle> {
    let task = doc.task(task_id)?;
    if matches!(task.status, TaskStatus::Complete | TaskStatus::Skipped) {
        return Err(TaskerError::invalid(format!(
            "task {} is {}, nothing to bundle",
            task_id, task.status
        )));
    }
    let target = PathBuf::from(&doc.target_dir);
    let (dependency_files, missing) = checksum_all(&target, &dependency_files(doc, task_id)?)?;
    if !missing.is_empty() {
        return Err(TaskerError::MissingDependency {
            task_id: task_id.to_string(),
            paths: missing,
        });
    }
    Ok(Bundle {
        version: BUNDLE_VERSION.to_string(),
        task_id: task.id.clone(),
        name: task.name.clone(),
        phase: task.phase,
        target_dir: doc.target_dir.clone(),
        dependencies: task.depends_on.clone(),
        dependency_files,
        files: task.files.clone(),
        created_at: Utc::now(),
    })
}

pub fn write_bundle(bundles_dir: &Path, bundle: &Bundle) -> Result<PathBuf> {
    let path = bundle_path(bundles_dir, &bundle.task_id);
    crate::store::atomic_write(&path, &crate::store::encode(bundle)?)?;
    Ok(path)
}

pub fn read_bundle(bundles_dir: &Path, task_id: &str) -> Result<Option<Bundle>> {
    let path = bundle_path(bundles_dir, task_id);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TaskerError::io(&path, e)),
    };
    let bundle = serde_json::from_slice(&bytes).map_err(|e| {
        TaskerError::invalid(format!("bundle {} is malformed: {}", path.display(), e))
    })?;
    Ok(Some(bundle))
}

/// Build and write a bundle, recording the preparation.
pub fn prepare(doc: &mut Document, task_id: &str, bundles_dir: &Path) -> Result<(Bundle, PathBuf)> {
    let bundle = build(doc, task_id)?;
    let path = write_bundle(bundles_dir, &bundle)?;
    doc.record(
        EventKind::BundlePrepared,
        Some(task_id),
        serde_json::json!({ "dependency_files": bundle.dependency_files.len() }),
    );
    tracing::info!(task_id, files = bundle.dependency_files.len(), "bundle prepared");
    Ok((bundle, path))
}

/// Compare a bundle's checksums with the files on disk. No side effects.
pub fn verify(bundle: &Bundle) -> Result<IntegrityReport> {
    let target = PathBuf::from(&bundle.target_dir);
    let mut drifted = Vec::new();
    let mut missing = Vec::new();
    for dep in &bundle.dependency_files {
        let path = resolve_within(&target, &dep.path)?;
        if !path.is_file() {
            missing.push(dep.path.clone());
            continue;
        }
        let actual = checksum_file(&path)?;
        if actual != dep.checksum {
            drifted.push(DriftedFile {
                path: dep.path.clone(),
                expected: dep.checksum.clone(),
                actual,
            });
        }
    }
    let status = if !missing.is_empty() {
        IntegrityStatus::Missing
    } else if !drifted.is_empty() {
        IntegrityStatus::Drift
    } else {
        IntegrityStatus::Valid
    };
    Ok(IntegrityReport {
        task_id: bundle.task_id.clone(),
        status,
        drifted,
        missing,
        regenerated: false,
    })
}

/// Pre-dispatch integrity check with the drift and missing-file policy
/// applied to the document.
///
/// Missing artifacts fail the task and come back as a `Missing` report so
/// the caller can persist the failure before surfacing the error.
pub fn check(doc: &mut Document, task_id: &str, bundles_dir: &Path) -> Result<IntegrityReport> {
    let bundle = match read_bundle(bundles_dir, task_id)? {
        Some(b) => b,
        None => {
            return Err(TaskerError::invalid(format!(
                "no bundle for task {}; run `tasker bundle prepare {}` first",
                task_id, task_id
            )));
        }
    };
    let mut report = verify(&bundle)?;

    match report.status {
        IntegrityStatus::Valid => {}
        IntegrityStatus::Drift => {
            let mut fresh = bundle;
            fresh.created_at = Utc::now();
            for dep in &mut fresh.dependency_files {
                if let Some(drift) = report.drifted.iter().find(|d| d.path == dep.path) {
                    dep.checksum = drift.actual.clone();
                }
            }
            write_bundle(bundles_dir, &fresh)?;
            report.regenerated = true;
            let paths: Vec<&str> = report.drifted.iter().map(|d| d.path.as_str()).collect();
            tracing::warn!(task_id, files = ?paths, "dependency drift detected, bundle regenerated");
            doc.record(
                EventKind::BundleDrift,
                Some(task_id),
                serde_json::json!({ "drifted": report.drifted }),
            );
        }
        IntegrityStatus::Missing => {
            let failure = TaskFailure {
                category: DEPENDENCY_CATEGORY.to_string(),
                message: format!("missing dependency artifact(s): {}", report.missing.join(", ")),
                retryable: false,
            };
            tracing::error!(task_id, missing = ?report.missing, "dependency artifact missing");
            let status = doc.task(task_id)?.status;
            if !status.is_terminal() {
                lifecycle::fail_undispatched(doc, task_id, failure)?;
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub task_id: String,
    pub path: PathBuf,
    pub has_result: bool,
}

pub fn list(bundles_dir: &Path) -> Result<Vec<BundleSummary>> {
    let entries = match fs::read_dir(bundles_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TaskerError::io(bundles_dir, e)),
    };
    let mut summaries = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TaskerError::io(bundles_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(task_id) = name.strip_suffix("-bundle.json") {
            summaries.push(BundleSummary {
                task_id: task_id.to_string(),
                path: entry.path(),
                has_result: result_path(bundles_dir, task_id).exists(),
            });
        }
    }
    summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    Ok(summaries)
}

/// Delete bundle and result files. Without `all`, only files of tasks that
/// are complete or skipped are removed. Returns the removed paths.
pub fn clean(doc: &Document, bundles_dir: &Path, all: bool) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(bundles_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TaskerError::io(bundles_dir, e)),
    };
    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TaskerError::io(bundles_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let task_id = name
            .strip_suffix("-bundle.json")
            .or_else(|| name.strip_suffix("-result.json"));
        let Some(task_id) = task_id else { continue };
        let finished = doc
            .status_of(task_id)
            .is_some_and(|s| s.satisfies_dependency());
        if all || finished {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| TaskerError::io(&path, e))?;
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::sequence_document;
    use crate::lifecycle::{FilesTouched, complete, start};
    use crate::state::Task;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        target: TempDir,
        planning: TempDir,
        doc: Document,
    }

    impl Fixture {
        fn bundles(&self) -> PathBuf {
            self.planning.path().join("bundles")
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.target.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    /// Producer creates `out/<name>.json`; consumer depends on it.
    fn fixture(consumer: &str, artifact: &str) -> Fixture {
        let target = tempdir().unwrap();
        let planning = tempdir().unwrap();
        let mut doc = Document::new(target.path().display().to_string());
        doc.tasks
            .insert("P".into(), Task::new("P", "producer").with_order(0));
        doc.tasks.insert(
            consumer.into(),
            Task::new(consumer, "consumer").with_deps(&["P"]).with_order(1),
        );
        sequence_document(&mut doc).unwrap();

        let fx = Fixture {
            target,
            planning,
            doc,
        };
        fx.write(artifact, "{\"v\": 1}");
        let mut doc = fx.doc.clone();
        start(&mut doc, "P").unwrap();
        complete(
            &mut doc,
            "P",
            &FilesTouched {
                created: vec![artifact.into()],
                modified: vec![],
            },
        )
        .unwrap();
        Fixture { doc, ..fx }
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            checksum_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_prepare_records_dependency_checksums() {
        let mut fx = fixture("T4", "out/A.json");
        let bundles = fx.bundles();
        let (bundle, path) = prepare(&mut fx.doc, "T4", &bundles).unwrap();
        assert!(path.ends_with("T4-bundle.json"));
        assert_eq!(bundle.dependency_files.len(), 1);
        assert_eq!(bundle.dependency_files[0].path, "out/A.json");
        assert_eq!(bundle.dependency_files[0].from_task.as_deref(), Some("P"));

        let report = check(&mut fx.doc, "T4", &bundles).unwrap();
        assert_eq!(report.status, IntegrityStatus::Valid);
        assert!(!report.regenerated);
    }

    #[test]
    fn test_drift_regenerates_bundle_and_proceeds() {
        let mut fx = fixture("T5", "out/A.json");
        let bundles = fx.bundles();
        let (before, _) = prepare(&mut fx.doc, "T5", &bundles).unwrap();
        let c1 = before.dependency_files[0].checksum.clone();

        fx.write("out/A.json", "{\"v\": 2}");
        let report = check(&mut fx.doc, "T5", &bundles).unwrap().into_result().unwrap();
        assert_eq!(report.status, IntegrityStatus::Drift);
        assert!(report.regenerated);
        assert_eq!(report.drifted[0].expected, c1);

        let after = read_bundle(&bundles, "T5").unwrap().unwrap();
        let c2 = checksum_file(&fx.target.path().join("out/A.json")).unwrap();
        assert_eq!(after.dependency_files[0].checksum, c2);
        assert_ne!(c1, c2);
        assert_eq!(fx.doc.status_of("T5"), Some(TaskStatus::Ready));
        assert!(fx.doc.events.iter().any(|e| e.kind == EventKind::BundleDrift));

        // A second check after regeneration is clean.
        let again = check(&mut fx.doc, "T5", &bundles).unwrap();
        assert_eq!(again.status, IntegrityStatus::Valid);
    }

    #[test]
    fn test_missing_artifact_fails_task_non_retryable() {
        let mut fx = fixture("T6", "out/B.json");
        let bundles = fx.bundles();
        prepare(&mut fx.doc, "T6", &bundles).unwrap();

        fs::remove_file(fx.target.path().join("out/B.json")).unwrap();
        let report = check(&mut fx.doc, "T6", &bundles).unwrap();
        assert_eq!(report.status, IntegrityStatus::Missing);
        assert_eq!(report.missing, vec!["out/B.json"]);

        let task = fx.doc.task("T6").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let failure = task.failure.as_ref().unwrap();
        assert_eq!(failure.category, DEPENDENCY_CATEGORY);
        assert!(!failure.retryable);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.category(), "integrity");
        assert!(err.to_string().contains("out/B.json"));
    }

    #[test]
    fn test_prepare_refuses_missing_reads() {
        let mut fx = fixture("T7", "out/C.json");
        fx.doc.task_mut("T7").unwrap().reads = vec!["docs/spec.md".into()];
        let bundles = fx.bundles();
        let err = prepare(&mut fx.doc, "T7", &bundles).unwrap_err();
        assert!(matches!(err, TaskerError::MissingDependency { .. }));
    }

    #[test]
    fn test_list_and_clean() {
        let mut fx = fixture("T8", "out/D.json");
        let bundles = fx.bundles();
        prepare(&mut fx.doc, "T8", &bundles).unwrap();
        fs::write(result_path(&bundles, "P"), "{}").unwrap();
        fs::write(bundle_path(&bundles, "P"), "{}").unwrap();

        let listed = list(&bundles).unwrap();
        let ids: Vec<&str> = listed.iter().map(|b| b.task_id.as_str()).collect();
        assert_eq!(ids, vec!["P", "T8"]);
        assert!(listed[0].has_result);

        let removed = clean(&fx.doc, &bundles, false).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(bundle_path(&bundles, "T8").exists());
        assert_eq!(clean(&fx.doc, &bundles, true).unwrap().len(), 1);
    }
}
