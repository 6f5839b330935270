//! Multi-stage worker pipelines.
//!
//! A stage runs a processing function in N parallel threads that share one
//! bounded input queue and one bounded output queue. Linking a stage to an
//! upstream makes the upstream's output queue its input queue, forming
//! chains that run concurrently.
//!
//! # Architecture
//!
//! ```text
//! send() ──► [input queue] ──► N × processing fn ──► [output queue] ──► next stage / outputs()
//!                                    │
//!                               join latch ──(reaches zero)──► output queue closed
//! ```
//!
//! # Design
//!
//! - **Typed payloads** — `Stage<I, O>` fixes item types at construction, and
//!   `link_from` only accepts an upstream whose output type matches.
//! - **Builder, then handle** — fields and links exist only on the builder;
//!   a started `Stage` cannot be reconfigured.
//! - **Crossbeam queues** — bounded MPMC channels, with `select!` against the
//!   cancel token on every blocking receive or send inside an instance.
//! - **Single closer** — an externally fed input is closed by `Stage::close`;
//!   a linked input is closed by its upstream's join latch.
//! - **Fan-out shares work** — several stages linked to one upstream compete
//!   for its items rather than each receiving a copy.

pub mod cancel;
pub mod error;
pub mod fields;
pub mod graph;
pub mod id;
pub mod latch;
pub mod queue;
pub mod stage;
pub mod worker;

pub use cancel::CancelToken;
pub use error::{
    FailureKind, InstanceFailure, JoinReport, PipelineError, PipelineResult, StageSendError,
};
pub use fields::{FieldStore, FieldValue};
pub use graph::{Edge, PipelineGraph, StageHandle, StageSnapshot, TopologySnapshot};
pub use id::{EdgeId, StageId};
pub use latch::CountdownLatch;
pub use queue::{QueueIter, StageQueue};
pub use stage::{
    ProcessFn, Stage, StageBuilder, StageDescriptor, StageState, StageStats,
    DEFAULT_CAPACITY_PER_INSTANCE, DEFAULT_CONCURRENCY,
};
pub use worker::{Inputs, Worker};
