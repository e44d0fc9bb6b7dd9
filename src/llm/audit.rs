//! Best-effort JSON-lines audit log of model attempts.

use crate::models::ArtifactKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::warn;

/// One audited model attempt.
#[derive(Debug, Serialize)]
pub struct AuditRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub run_id: &'a str,
    pub stage: ArtifactKind,
    pub attempt: u32,
    pub model: &'a str,
    pub prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<&'a str>,
    pub outcome: String,
}

/// Append-only audit file. Write failures are logged and swallowed.
///
/// Appends run on the blocking pool.
pub struct AuditSink {
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
}

impl AuditSink {
    /// The file is opened lazily on the first record.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record; never fails the caller.
    pub async fn record(&self, record: &AuditRecord<'_>) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit record");
                return;
            }
        };
        line.push(b'\n');

        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        let result = task::spawn_blocking(move || append_line(&file, &path, &line)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %self.path.display(), error = %e, "Failed to write audit record"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Audit writer task failed"),
        }
    }
}

fn append_line(file: &Mutex<Option<File>>, path: &Path, line: &[u8]) -> std::io::Result<()> {
    let mut guard = match file.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if guard.is_none() {
        *guard = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }

    match guard.as_mut() {
        Some(file) => {
            file.write_all(line)?;
            file.flush()
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<'a>(run_id: &'a str, outcome: &str) -> AuditRecord<'a> {
        AuditRecord {
            timestamp: Utc::now(),
            run_id,
            stage: ArtifactKind::Scenario,
            attempt: 1,
            model: "m",
            prompt: "p",
            raw_response: Some("{}"),
            outcome: outcome.to_string(),
        }
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path().join("audit.jsonl"));

        sink.record(&record("1", "success")).await;
        sink.record(&record("2", "retrying")).await;

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["run_id"], "1");
        assert_eq!(lines[1]["outcome"], "retrying");
        assert_eq!(lines[0]["stage"], "scenario");
    }

    #[tokio::test]
    async fn test_unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path().join("missing").join("audit.jsonl"));
        sink.record(&record("1", "success")).await;
        assert!(!sink.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_records_stay_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(AuditSink::new(dir.path().join("audit.jsonl")));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let run_id = i.to_string();
                    sink.record(&record(&run_id, "success")).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 16);
        for line in content.lines() {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
