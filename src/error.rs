//! Error handling for cellpipe
//!
//! `PipelineError` covers everything the engine raises. This module wraps it
//! together with configuration and IO failures for callers above the engine.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for cellpipe operations
#[derive(Error, Debug)]
pub enum CellPipeError {
    /// Errors raised by the pipeline engine
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CellPipeError {
    fn from(e: serde_json::Error) -> Self {
        CellPipeError::Serialization(e.to_string())
    }
}

/// Result type alias for cellpipe operations
pub type Result<T> = std::result::Result<T, CellPipeError>;
