//! Filesystem run store.
//!
//! Layout: `<root>/<run_id>/{run.json,scenario.json,governance.json,evaluation.json}`
//! plus `<root>/evaluation_summary.json`. Every write goes through a temp
//! file in the destination directory followed by a rename, so a reader never
//! observes a partially written artifact.

use crate::models::{compare_run_ids, ArtifactKind, CorpusSummary, RunManifest, RunRecord};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Manifest file name inside a run directory.
pub const MANIFEST_FILE: &str = "run.json";

/// Corpus summary file name at the store root.
pub const SUMMARY_FILE: &str = "evaluation_summary.json";

/// Errors from the run store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid run id '{0}': must be a single path component")]
    InvalidRunId(String),

    #[error("Run {run_id} has no {kind} artifact")]
    NotFound { run_id: String, kind: ArtifactKind },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reject ids that would escape the root or collide with store files.
fn check_run_id(run_id: &str) -> Result<(), StoreError> {
    let mut components = Path::new(run_id).components();
    let valid = matches!(components.next(), Some(Component::Normal(c)) if c == run_id)
        && components.next().is_none()
        && !run_id.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRunId(run_id.to_string()))
    }
}

/// Write `value` as pretty JSON to `path` through a temp file in `dir`.
fn write_json_atomic<T: Serialize + ?Sized>(dir: &Path, path: &Path, value: &T) -> Result<(), StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&bytes).map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&content).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Filesystem-backed store of run artifacts.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    allocation: Mutex<()>,
}

impl RunStore {
    /// Create a store handle without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allocation: Mutex::new(()),
        }
    }

    /// Create the root if needed and check that it is writable.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root).map_err(io_err(&store.root))?;

        let scratch = NamedTempFile::new_in(&store.root).map_err(io_err(&store.root))?;
        drop(scratch);

        debug!(root = %store.root.display(), "Opened run store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        check_run_id(run_id)?;
        Ok(self.root.join(run_id))
    }

    pub fn artifact_path(&self, run_id: &str, kind: ArtifactKind) -> Result<PathBuf, StoreError> {
        Ok(self.run_dir(run_id)?.join(kind.file_name()))
    }

    /// Whether the run directory exists. Invalid ids never exist.
    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).map(|dir| dir.is_dir()).unwrap_or(false)
    }

    /// Whether a complete artifact is present. Invalid ids never exist.
    pub fn exists(&self, run_id: &str, kind: ArtifactKind) -> bool {
        self.artifact_path(run_id, kind)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Atomically write an artifact, replacing any previous version.
    pub fn write(&self, run_id: &str, kind: ArtifactKind, payload: &Value) -> Result<PathBuf, StoreError> {
        let dir = self.run_dir(run_id)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = dir.join(kind.file_name());
        write_json_atomic(&dir, &path, payload)?;
        debug!(run_id, stage = %kind, path = %path.display(), "Wrote artifact");
        Ok(path)
    }

    pub fn read(&self, run_id: &str, kind: ArtifactKind) -> Result<Value, StoreError> {
        let path = self.artifact_path(run_id, kind)?;
        if !path.is_file() {
            return Err(StoreError::NotFound {
                run_id: run_id.to_string(),
                kind,
            });
        }
        read_json(&path)
    }

    /// The run manifest, if one was written.
    pub fn manifest(&self, run_id: &str) -> Result<Option<RunManifest>, StoreError> {
        let path = self.run_dir(run_id)?.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Allocate one fresh run per class tag.
    ///
    /// New ids continue after the largest numeric id already present.
    /// Allocation is serialized so concurrent callers never share an id.
    pub fn allocate_runs(&self, class_tags: &[String]) -> Result<Vec<RunManifest>, StoreError> {
        let _guard = match self.allocation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let mut next = self
            .list_run_ids()?
            .iter()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);

        let mut manifests = Vec::with_capacity(class_tags.len());
        for class_tag in class_tags {
            let run_id = next.to_string();
            next += 1;

            let dir = self.root.join(&run_id);
            fs::create_dir(&dir).map_err(io_err(&dir))?;

            let manifest = RunManifest {
                run_id,
                class_tag: class_tag.clone(),
                created_at: Utc::now(),
            };
            write_json_atomic(&dir, &dir.join(MANIFEST_FILE), &manifest)?;
            manifests.push(manifest);
        }

        Ok(manifests)
    }

    /// Run ids present under the root, numeric ids first in numeric order.
    pub fn list_run_ids(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.root.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if check_run_id(name).is_ok() {
                ids.push(name.to_string());
            }
        }

        ids.sort_by(|a, b| compare_run_ids(a, b));
        Ok(ids)
    }

    /// Load every run with whatever artifacts it has.
    ///
    /// An artifact that cannot be read or is not valid JSON is loaded as
    /// `null` so downstream validation rejects the run instead of the whole
    /// scan failing. Failing to list the root is still an error.
    pub fn read_all_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut runs = Vec::new();

        for run_id in self.list_run_ids()? {
            let mut record = RunRecord {
                run_id: run_id.clone(),
                ..RunRecord::default()
            };

            record.class_tag = match self.manifest(&run_id) {
                Ok(manifest) => manifest.map(|m| m.class_tag),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Ignoring unreadable run manifest");
                    None
                }
            };

            for kind in ArtifactKind::ALL {
                if !self.exists(&run_id, kind) {
                    continue;
                }
                let value = match self.read(&run_id, kind) {
                    Ok(value) => value,
                    Err(e @ (StoreError::Json { .. } | StoreError::Io { .. })) => {
                        warn!(run_id = %run_id, stage = %kind, error = %e, "Artifact is unreadable");
                        Value::Null
                    }
                    Err(e) => return Err(e),
                };
                match kind {
                    ArtifactKind::Scenario => record.scenario = Some(value),
                    ArtifactKind::Governance => record.governance = Some(value),
                    ArtifactKind::Evaluation => record.evaluation = Some(value),
                }
            }

            runs.push(record);
        }

        Ok(runs)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    /// Atomically write the corpus summary.
    pub fn write_summary(&self, summary: &CorpusSummary) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
        let path = self.summary_path();
        write_json_atomic(&self.root, &path, summary)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("data")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_read_exists() {
        let (_dir, store) = make_store();
        assert!(!store.exists("1", ArtifactKind::Scenario));

        let payload = json!({"title": "drift", "steps": [1, 2]});
        store.write("1", ArtifactKind::Scenario, &payload).unwrap();

        assert!(store.exists("1", ArtifactKind::Scenario));
        assert!(!store.exists("1", ArtifactKind::Governance));
        assert_eq!(store.read("1", ArtifactKind::Scenario).unwrap(), payload);
    }

    #[test]
    fn test_overwrite_replaces() {
        let (_dir, store) = make_store();
        store.write("1", ArtifactKind::Scenario, &json!({"v": 1})).unwrap();
        store.write("1", ArtifactKind::Scenario, &json!({"v": 2})).unwrap();
        assert_eq!(store.read("1", ArtifactKind::Scenario).unwrap()["v"], 2);
    }

    #[test]
    fn test_abandoned_temp_file_is_not_an_artifact() {
        let (_dir, store) = make_store();
        let run_dir = store.run_dir("7").unwrap();
        fs::create_dir_all(&run_dir).unwrap();

        // A writer that died after writing but before the rename.
        let mut tmp = NamedTempFile::new_in(&run_dir).unwrap();
        tmp.write_all(br#"{"metrics": {"coher"#).unwrap();
        let (_file, _kept) = tmp.keep().unwrap();

        for kind in ArtifactKind::ALL {
            assert!(!store.exists("7", kind));
        }
        assert!(matches!(
            store.read("7", ArtifactKind::Evaluation),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_run_exists() {
        let (_dir, store) = make_store();
        assert!(!store.run_exists("1"));
        store.allocate_runs(&["A".to_string()]).unwrap();
        assert!(store.run_exists("1"));
        assert!(!store.run_exists(".."));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let (_dir, store) = make_store();
        let err = store.read("3", ArtifactKind::Governance).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: ArtifactKind::Governance, .. }));
    }

    #[test]
    fn test_rejects_path_like_run_ids() {
        let (_dir, store) = make_store();
        for bad in ["", "..", "../etc", "a/b", "/abs", ".hidden"] {
            assert!(
                matches!(store.run_dir(bad), Err(StoreError::InvalidRunId(_))),
                "accepted {:?}",
                bad
            );
            assert!(!store.exists(bad, ArtifactKind::Scenario));
        }
        assert!(store.run_dir("run-01").is_ok());
    }

    #[test]
    fn test_allocate_continues_numbering() {
        let (_dir, store) = make_store();
        store.write("2", ArtifactKind::Scenario, &json!({})).unwrap();
        fs::create_dir_all(store.root().join("notes")).unwrap();

        let tags = vec!["Goal Drift".to_string(), "Normal Operation".to_string()];
        let manifests = store.allocate_runs(&tags).unwrap();
        let ids: Vec<_> = manifests.iter().map(|m| m.run_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);

        let manifest = store.manifest("4").unwrap().unwrap();
        assert_eq!(manifest.class_tag, "Normal Operation");
        assert!(store.manifest("2").unwrap().is_none());
    }

    #[test]
    fn test_list_run_ids_sorted_numerically() {
        let (_dir, store) = make_store();
        for id in ["10", "2", "1", "alpha"] {
            store.write(id, ArtifactKind::Scenario, &json!({})).unwrap();
        }
        store.write_summary(&CorpusSummary::default()).unwrap();

        assert_eq!(store.list_run_ids().unwrap(), vec!["1", "2", "10", "alpha"]);
    }

    #[test]
    fn test_list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("nope"));
        assert!(store.list_run_ids().unwrap().is_empty());
    }

    #[test]
    fn test_read_all_runs() {
        let (_dir, store) = make_store();
        let manifests = store.allocate_runs(&["Goal Drift".to_string()]).unwrap();
        let id = &manifests[0].run_id;
        store.write(id, ArtifactKind::Scenario, &json!({"s": 1})).unwrap();
        fs::write(store.artifact_path(id, ArtifactKind::Evaluation).unwrap(), "{broken").unwrap();

        let runs = store.read_all_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].class_tag.as_deref(), Some("Goal Drift"));
        assert_eq!(runs[0].scenario, Some(json!({"s": 1})));
        assert!(runs[0].governance.is_none());
        assert_eq!(runs[0].evaluation, Some(Value::Null));
    }

    #[test]
    fn test_read_all_runs_tolerates_non_utf8_artifact() {
        let (_dir, store) = make_store();
        store.write("1", ArtifactKind::Scenario, &json!({"s": 1})).unwrap();
        fs::write(store.artifact_path("1", ArtifactKind::Evaluation).unwrap(), [0xff, 0xfe, 0x7b]).unwrap();

        let runs = store.read_all_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].scenario, Some(json!({"s": 1})));
        assert_eq!(runs[0].evaluation, Some(Value::Null));
    }

    #[test]
    fn test_open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        fs::write(&file, "x").unwrap();
        assert!(RunStore::open(&file).is_err());
    }

    #[test]
    fn test_write_summary() {
        let (_dir, store) = make_store();
        let summary = CorpusSummary {
            total_runs: 3,
            ..CorpusSummary::default()
        };
        let path = store.write_summary(&summary).unwrap();
        let back: CorpusSummary = read_json(&path).unwrap();
        assert_eq!(back.total_runs, 3);
    }
}
