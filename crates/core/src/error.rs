//! Pipeline error model.

use thiserror::Error;

use crate::id::{JobId, MessageId};
use crate::status::JobStatus;

/// Result type used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Caller-facing error taxonomy.
///
/// State-machine violations are rejected locally and returned as typed errors;
/// they are never coerced into a different transition. A disabled channel is
/// not an error (job creation reports `Skipped`), and a missing tenant config
/// is resolved with defaults, so neither appears here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// `(from, to)` is not in the legal transition table.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The job does not exist or has been soft-deleted.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Manual retry requested for a job that is not `failed`.
    #[error("job is not retryable in status {status}")]
    NotRetryable { status: JobStatus },

    /// Cancel requested for a job that has already left the pre-delivery states.
    #[error("job cannot be cancelled in status {status}")]
    NotCancellable { status: JobStatus },

    /// Force-complete requested for a job that is not `processing`.
    #[error("job is not processing (status {status})")]
    NotInProcessing { status: JobStatus },

    /// The job's status changed between read and conditional write.
    #[error("conflicting transition: expected {expected}, found {actual}")]
    ConflictingTransition {
        expected: JobStatus,
        actual: JobStatus,
    },

    /// No dead-letter message with this id.
    #[error("dead-letter message not found: {0}")]
    DlqMessageNotFound(MessageId),

    /// A request failed validation (e.g. missing recipient address).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable snake_case name of the variant, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::NotRetryable { .. } => "not_retryable",
            Self::NotCancellable { .. } => "not_cancellable",
            Self::NotInProcessing { .. } => "not_in_processing",
            Self::ConflictingTransition { .. } => "conflicting_transition",
            Self::DlqMessageNotFound(_) => "dlq_message_not_found",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
        }
    }
}
