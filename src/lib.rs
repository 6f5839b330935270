//! # workers-rs: concurrent worker pipelines
//!
//! Stages run a processing function in N parallel threads that share one
//! bounded input queue. A stage can be linked to an upstream stage so that
//! the upstream's output becomes its input, forming chains where every stage
//! runs concurrently with the others.
//!
//! ## Architecture
//!
//! - **Pipeline**: stages, their queues, join barriers and the stage graph
//! - **Config**: JSON/TOML files describing stage concurrency, capacity and fields
//! - **Communication**: Crossbeam bounded channels with cancellation via `select!`
//!
//! ## Example
//!
//! ```no_run
//! use workers_rs::pipeline::{CancelToken, Stage, Worker};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cancel = CancelToken::new();
//!
//! let double = Stage::builder("double", cancel.clone(), |w: &Worker<i64, i64>| {
//!     let factor = w.get_field_int("factor").unwrap_or(1);
//!     for item in w.inputs() {
//!         w.emit(item * factor)?;
//!     }
//!     Ok(())
//! })
//! .concurrency(4)
//! .field("factor", 2)
//! .start()?;
//!
//! let print = Stage::builder("print", cancel, |w: &Worker<i64, ()>| {
//!     for item in w.inputs() {
//!         println!("{}", item);
//!     }
//!     Ok(())
//! })
//! .link_from(&double)
//! .start()?;
//!
//! for i in 1..=3 {
//!     double.send(i).map_err(|e| e.reason)?;
//! }
//! double.close()?;
//! double.join()?;
//! print.join()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;

pub use config::{PipelineConfig, StageConfig};
pub use error::{Result, ResultExt, WorkersError};
pub use pipeline::{
    CancelToken, FieldStore, FieldValue, PipelineError, PipelineGraph, PipelineResult, Stage,
    StageBuilder, StageState, Worker,
};
