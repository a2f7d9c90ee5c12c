//! Domain error model.

use thiserror::Error;

use crate::job::{JobKind, JobStage, JobState};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Covers deterministic failures of the job model itself (illegal transitions,
/// stage ordering, malformed identifiers). Storage failures belong to the
/// store error types in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested state transition is not legal from the current state.
    #[error("illegal transition {transition} from state {from}")]
    IllegalTransition { from: JobState, transition: &'static str },

    /// A stage does not belong to the job kind, or is not the expected next stage.
    #[error("stage order violated for {kind}: {detail}")]
    StageOrder { kind: JobKind, detail: String },

    /// A stage was requested past the final stage of a kind.
    #[error("stage {0} is the final stage")]
    FinalStage(JobStage),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn stage_order(kind: JobKind, detail: impl Into<String>) -> Self {
        Self::StageOrder {
            kind,
            detail: detail.into(),
        }
    }
}
