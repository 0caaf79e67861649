//! Error types for query result streams
//!
//! Producer failures, state misuse and the handful of conditions a stream
//! can run into on its own are all reported through [`QueryError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by a query source through its terminal `error` sentinel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    /// Producer-specific status code, if the source has one
    pub code: Option<u32>,
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SourceError {}

/// Main error type for result stream operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The source finished the query with an error sentinel
    #[error("query failed: {0}")]
    Producer(SourceError),
    /// Operation not allowed in the current state (reset while running, double perform)
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The rows of a streamed run were dropped after visiting
    #[error("streamed results are not restartable; call reset() first")]
    NotRestartable,
    /// The source dropped its callback without sending a terminal sentinel
    #[error("query source disconnected before completion")]
    Disconnected,
    /// No metadata carries a total and the buffered rows are not the full result
    #[error("row count unavailable for a partial result")]
    CountUnavailable,
}

impl QueryError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        QueryError::InvalidState(msg.into())
    }

    /// Whether this error came from the producer rather than from stream misuse
    pub fn is_producer(&self) -> bool {
        matches!(self, QueryError::Producer(_))
    }
}

impl From<SourceError> for QueryError {
    fn from(err: SourceError) -> Self {
        QueryError::Producer(err)
    }
}

/// Result type for query stream operations
pub type QueryResult<T> = Result<T, QueryError>;
