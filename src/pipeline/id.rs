//! Identity types for the pipeline system.
//!
//! `StageId` is allocated from a process-wide counter when a stage builder is
//! created, so ids stay unique across independently built pipelines.
//! `EdgeId` is an index into `PipelineGraph::edges`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_STAGE_ID: AtomicU32 = AtomicU32::new(0);

/// Unique identity of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u32);

impl StageId {
    /// Allocate a fresh id.
    pub(crate) fn next() -> Self {
        StageId(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Index into `PipelineGraph::edges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);
