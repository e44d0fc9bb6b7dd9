//! Stage execution and batch orchestration.

pub mod orchestrator;
pub mod stages;

pub use orchestrator::{run_batch, run_batch_with_progress, BatchError};
pub use stages::{available_variables, execute, StageContext};

use crate::llm::InvocationError;
use crate::models::{ArtifactKind, InvocationStatus};
use crate::prompt::RenderError;
use crate::store::StoreError;
use crate::validate::ValidationFailure;
use serde_json::Value;
use thiserror::Error;

/// Non-failing result of one stage function call.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The artifact was produced and persisted.
    Success(Value),
    /// The artifact already existed and overwrite was off.
    Skipped,
}

/// Why a single item failed.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Missing prerequisite {0} artifact")]
    MissingPrerequisite(ArtifactKind),

    #[error("Run {0} does not exist")]
    UnknownRun(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("Invalid model output at {0}")]
    Validation(#[from] ValidationFailure),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("{0}")]
    Permanent(String),
}

impl StageError {
    /// Per-item status recorded for this error.
    pub fn status(&self) -> InvocationStatus {
        match self {
            StageError::Invocation(InvocationError::Transient { .. }) => InvocationStatus::TransientFailure,
            StageError::Validation(_) => InvocationStatus::ValidationFailure,
            StageError::Storage(_) => InvocationStatus::StorageFailure,
            StageError::MissingPrerequisite(_)
            | StageError::UnknownRun(_)
            | StageError::Render(_)
            | StageError::Invocation(InvocationError::Permanent { .. })
            | StageError::Permanent(_) => InvocationStatus::PermanentFailure,
        }
    }
}
