//! Error handling for workers-rs
//!
//! Crate-level errors wrap pipeline failures together with the configuration
//! and I/O errors raised around them.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for workers-rs operations
#[derive(Error, Debug)]
pub enum WorkersError {
    /// Errors raised by stages, their queues or their fields
    #[error("Pipeline error: {0}")]
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

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<WorkersError>,
    },
}

impl WorkersError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        WorkersError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for workers-rs operations
pub type Result<T> = std::result::Result<T, WorkersError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| WorkersError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| WorkersError::from(e).with_context(f()))
    }
}
