use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::feed::{FetchError, ParseError};
use crate::storage::StoreError;

/// Any error that can abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse error classification reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NetworkError,
    TimeoutError,
    MalformedFeedError,
    StoreError,
    ConfigError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::MalformedFeedError => "MalformedFeedError",
            ErrorKind::StoreError => "StoreError",
            ErrorKind::ConfigError => "ConfigError",
        };
        f.write_str(name)
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch(e) if e.is_timeout() => ErrorKind::TimeoutError,
            // An oversized body is a property of the document, not the network.
            PipelineError::Fetch(e) if !e.is_retryable() => ErrorKind::MalformedFeedError,
            PipelineError::Fetch(_) => ErrorKind::NetworkError,
            PipelineError::Parse(_) => ErrorKind::MalformedFeedError,
            PipelineError::Store(_) => ErrorKind::StoreError,
            PipelineError::Config(_) => ErrorKind::ConfigError,
        }
    }

    /// Returns true if another fetch attempt may succeed.
    pub fn is_retryable_fetch(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkError | ErrorKind::TimeoutError
        )
    }
}
