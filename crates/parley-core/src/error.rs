//! Error taxonomy for an analysis run.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while running an analysis.
///
/// Only [`AnalysisError::Validation`] and [`AnalysisError::BudgetExceeded`]
/// abort a run; chunk-level errors are reported inline and the run continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Bad input shape, rejected before any budget is spent.
    #[error("validation error: {0}")]
    Validation(String),

    /// Daily token budget exhausted; all charges fail until `lock_until`.
    #[error("daily token budget exceeded; locked until {lock_until}")]
    BudgetExceeded { lock_until: DateTime<Utc> },

    /// Network, timeout or HTTP failure talking to the model for one chunk.
    #[error("chunk {chunk_number}: transport error: {message}")]
    ChunkTransport { chunk_number: usize, message: String },

    /// The model answered but the answer could not be parsed.
    #[error("chunk {chunk_number}: malformed response: {message}")]
    ChunkMalformed { chunk_number: usize, message: String },

    /// Internal merge bug signal. Logged, never surfaced to callers.
    #[error("merge invariant violated: {0}")]
    MergeInvariant(String),

    /// The caller went away.
    #[error("stream closed by caller")]
    StreamTransport,

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AnalysisError {
    /// Whether this error ends the run with a fatal `error` event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalysisError::Validation(_) | AnalysisError::BudgetExceeded { .. }
        )
    }

    /// 1-based chunk number for chunk-scoped errors.
    pub fn chunk_number(&self) -> Option<usize> {
        match self {
            AnalysisError::ChunkTransport { chunk_number, .. }
            | AnalysisError::ChunkMalformed { chunk_number, .. } => Some(*chunk_number),
            _ => None,
        }
    }

    pub fn lock_until(&self) -> Option<DateTime<Utc>> {
        match self {
            AnalysisError::BudgetExceeded { lock_until } => Some(*lock_until),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for AnalysisError {
    fn from(err: anyhow::Error) -> Self {
        AnalysisError::Storage(format!("{:#}", err))
    }
}

/// Result alias for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AnalysisError::Validation("x".into()).is_fatal());
        assert!(AnalysisError::BudgetExceeded {
            lock_until: Utc::now()
        }
        .is_fatal());
        let chunk = AnalysisError::ChunkTransport {
            chunk_number: 2,
            message: "timeout".into(),
        };
        assert!(!chunk.is_fatal());
        assert_eq!(chunk.chunk_number(), Some(2));
        assert!(!AnalysisError::StreamTransport.is_fatal());
    }
}
