//! Pipeline-specific error types.

use crate::pipeline::id::StageId;
use std::fmt;
use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Illegal lifecycle transition or invalid builder settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Field '{key}' is not set")]
    FieldAbsent { key: String },

    #[error("Field '{key}' holds {found}, expected {expected}")]
    FieldTypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Field '{key}' could not be decoded: {source}")]
    FieldDecode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Input stream is closed")]
    InputClosed,

    #[error("Queue is full")]
    QueueFull,

    /// Every instance of the stage has exited; nothing will read its input.
    #[error("Stage has no running instances")]
    Stopped,

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Join(#[from] JoinReport),

    #[error("{}", describe_stage_failures(.0))]
    Stages(Vec<PipelineError>),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

fn describe_stage_failures(errors: &[PipelineError]) -> String {
    let mut text = format!("{} stage(s) failed", errors.len());
    for err in errors {
        text.push('\n');
        text.push_str(&err.to_string());
    }
    text
}

/// Error returned by [`Stage::send`](crate::pipeline::Stage::send).
///
/// The rejected item is handed back so it is never silently lost.
pub struct StageSendError<T> {
    pub item: T,
    pub reason: PipelineError,
}

impl<T> StageSendError<T> {
    pub(crate) fn new(item: T, reason: PipelineError) -> Self {
        Self { item, reason }
    }

    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for StageSendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSendError")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for StageSendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send rejected: {}", self.reason)
    }
}

impl<T> std::error::Error for StageSendError<T> {}

/// How a single instance terminated unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The processing function returned an error.
    Processing,
    /// The instance stopped because the cancel token fired.
    Cancelled,
    /// The processing function panicked.
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Processing => write!(f, "processing error"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Panicked => write!(f, "panicked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFailure {
    pub instance: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Composite error produced by `join` when one or more instances failed.
#[derive(Debug, Clone)]
pub struct JoinReport {
    pub stage: StageId,
    pub stage_name: String,
    pub instances: usize,
    pub failures: Vec<InstanceFailure>,
}

impl JoinReport {
    /// True when every failure is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        !self.failures.is_empty()
            && self
                .failures
                .iter()
                .all(|f| f.kind == FailureKind::Cancelled)
    }

    pub fn processing_failures(&self) -> impl Iterator<Item = &InstanceFailure> {
        self.failures
            .iter()
            .filter(|f| f.kind != FailureKind::Cancelled)
    }
}

impl fmt::Display for JoinReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage '{}' ({}): {} of {} instances failed",
            self.stage_name,
            self.stage,
            self.failures.len(),
            self.instances
        )?;
        for failure in &self.failures {
            write!(
                f,
                "\n  instance {} {}: {}",
                failure.instance, failure.kind, failure.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinReport {}
