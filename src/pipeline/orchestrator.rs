//! Bounded-concurrency batch execution.

use crate::models::{ArtifactKind, InvocationResult, InvocationStatus, WorkItem};
use crate::pipeline::{StageError, StageOutcome};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration errors detected before any item runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("Duplicate work item: run {run_id}, stage {stage}")]
    DuplicateItem { run_id: String, stage: ArtifactKind },
}

fn check_items(items: &[WorkItem], limit: usize) -> Result<(), BatchError> {
    if limit == 0 {
        return Err(BatchError::ZeroConcurrency);
    }

    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert((item.run_id.as_str(), item.stage)) {
            return Err(BatchError::DuplicateItem {
                run_id: item.run_id.clone(),
                stage: item.stage,
            });
        }
    }
    Ok(())
}

fn to_result(
    item: (String, String, ArtifactKind),
    outcome: Result<StageOutcome, StageError>,
    elapsed_ms: u64,
) -> InvocationResult {
    let (run_id, class_tag, stage) = item;
    let (status, payload, error) = match outcome {
        Ok(StageOutcome::Success(value)) => (InvocationStatus::Success, Some(value), None),
        Ok(StageOutcome::Skipped) => (InvocationStatus::Skipped, None, None),
        Err(e) => (e.status(), None, Some(e.to_string())),
    };

    InvocationResult {
        run_id,
        class_tag,
        stage,
        status,
        payload,
        error,
        elapsed_ms,
    }
}

/// Run `stage_fn` over every item with at most `limit` in flight.
///
/// Returns once every item has a terminal status. Result order is
/// unspecified.
pub async fn run_batch<F, Fut>(
    items: Vec<WorkItem>,
    limit: usize,
    stage_fn: F,
) -> Result<Vec<InvocationResult>, BatchError>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send + 'static,
{
    run_batch_with_progress(items, limit, stage_fn, ProgressBar::hidden()).await
}

/// [`run_batch`] that ticks `progress` once per finished item.
pub async fn run_batch_with_progress<F, Fut>(
    items: Vec<WorkItem>,
    limit: usize,
    stage_fn: F,
    progress: ProgressBar,
) -> Result<Vec<InvocationResult>, BatchError>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutcome, StageError>> + Send + 'static,
{
    check_items(&items, limit)?;

    let semaphore = Arc::new(Semaphore::new(limit));
    let stage_fn = Arc::new(stage_fn);
    let mut pending = FuturesUnordered::new();

    progress.set_length(items.len() as u64);

    for item in items {
        let key = (item.run_id.clone(), item.class_tag.clone(), item.stage);
        let semaphore = Arc::clone(&semaphore);
        let stage_fn = Arc::clone(&stage_fn);

        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        Err(StageError::Permanent("batch semaphore closed".to_string())),
                        0,
                    )
                }
            };
            let start = Instant::now();
            let outcome = stage_fn(item).await;
            (outcome, start.elapsed().as_millis() as u64)
        });

        pending.push(async move { (key, handle.await) });
    }

    let mut results = Vec::with_capacity(pending.len());
    while let Some((key, joined)) = pending.next().await {
        let result = match joined {
            Ok((outcome, elapsed_ms)) => to_result(key, outcome, elapsed_ms),
            Err(e) => {
                let reason = if e.is_panic() {
                    "stage task panicked".to_string()
                } else {
                    format!("stage task failed: {}", e)
                };
                to_result(key, Err(StageError::Permanent(reason)), 0)
            }
        };

        if result.status.is_failure() {
            warn!(
                run_id = %result.run_id,
                stage = %result.stage,
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "Item failed"
            );
        } else {
            debug!(run_id = %result.run_id, stage = %result.stage, status = %result.status, "Item finished");
        }

        progress.set_message(format!("run {}", result.run_id));
        progress.inc(1);
        results.push(result);
    }

    progress.finish_and_clear();
    Ok(results)
}
