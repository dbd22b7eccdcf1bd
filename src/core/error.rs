//! Pipeline-level error taxonomy.

use thiserror::Error;

use crate::adapters::{BaselineError, CropError, OcrError};
use crate::domain::{Blocker, Stage};
use crate::store::StoreError;

/// Errors surfaced by pipeline operations.
///
/// Expected non-success outcomes (blocked, not found, invalid input) are
/// distinct variants so callers never have to inspect messages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Witness {witness_id} is blocked at stage {stage}: {}", format_blockers(.blockers))]
    Blocked {
        witness_id: String,
        stage: Stage,
        blockers: Vec<Blocker>,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl PipelineError {
    /// Exit status for the CLI boundary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::NotFound { .. } => 2,
            Self::Blocked { .. } => 3,
            Self::Execution(_) | Self::Store(_) => 1,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

fn format_blockers(blockers: &[Blocker]) -> String {
    blockers
        .iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::InvalidInput(msg) => Self::Validation(msg),
            other => Self::Store(other),
        }
    }
}

impl From<OcrError> for PipelineError {
    fn from(err: OcrError) -> Self {
        Self::Execution(err.to_string())
    }
}

impl From<CropError> for PipelineError {
    fn from(err: CropError) -> Self {
        if err.is_invalid_box() {
            Self::Validation(err.to_string())
        } else {
            Self::Execution(err.to_string())
        }
    }
}

impl From<BaselineError> for PipelineError {
    fn from(err: BaselineError) -> Self {
        Self::Execution(err.to_string())
    }
}
