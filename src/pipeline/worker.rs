//! Per-instance handle passed to a stage's processing function.
//!
//! Each of the N instances of a stage receives its own `Worker`, holding a
//! receiver on the shared input queue, a sender on the shared output queue,
//! the stage's frozen field store and the cancel token.

use crate::pipeline::cancel::CancelToken;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fields::{FieldStore, FieldValue};
use crate::pipeline::id::StageId;
use crossbeam_channel::{select, Receiver, Sender};
use serde::de::DeserializeOwned;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Item counters shared by all instances of a stage.
#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    pub received: AtomicU64,
    pub emitted: AtomicU64,
}

pub struct Worker<I, O> {
    stage: StageId,
    stage_name: Arc<str>,
    instance: usize,
    input: Receiver<I>,
    output: Sender<O>,
    fields: Arc<FieldStore>,
    cancel: CancelToken,
    halt: CancelToken,
    counters: Arc<StageCounters>,
    input_finished: Cell<bool>,
    cancel_observed: Cell<bool>,
}

enum Next<I> {
    Item(I),
    Closed,
    Cancelled,
}

impl<I, O> Worker<I, O> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stage: StageId,
        stage_name: Arc<str>,
        instance: usize,
        input: Receiver<I>,
        output: Sender<O>,
        fields: Arc<FieldStore>,
        cancel: CancelToken,
        halt: CancelToken,
        counters: Arc<StageCounters>,
    ) -> Self {
        Self {
            stage,
            stage_name,
            instance,
            input,
            output,
            fields,
            cancel,
            halt,
            counters,
            input_finished: Cell::new(false),
            cancel_observed: Cell::new(false),
        }
    }

    pub fn stage_id(&self) -> StageId {
        self.stage
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Index of this instance within its stage, `0..concurrency`.
    pub fn instance(&self) -> usize {
        self.instance
    }

    /// True once the pipeline is cancelled or this stage is aborted.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.halt.is_cancelled()
    }

    /// Whether this instance stopped reading or writing because of cancellation.
    pub(crate) fn cancel_observed(&self) -> bool {
        self.cancel_observed.get()
    }

    fn observe_cancel(&self) {
        self.cancel_observed.set(true);
        self.input_finished.set(true);
    }

    fn next(&self) -> Next<I> {
        if self.input_finished.get() {
            return if self.cancel_observed.get() {
                Next::Cancelled
            } else {
                Next::Closed
            };
        }
        // Checked up front: select! picks randomly among ready operations.
        if self.is_cancelled() {
            self.observe_cancel();
            return Next::Cancelled;
        }
        select! {
            recv(self.input) -> msg => match msg {
                Ok(item) => {
                    self.counters.received.fetch_add(1, Ordering::Relaxed);
                    Next::Item(item)
                }
                Err(_) => {
                    self.input_finished.set(true);
                    Next::Closed
                }
            },
            recv(self.cancel.signal()) -> _ => {
                self.observe_cancel();
                Next::Cancelled
            },
            recv(self.halt.signal()) -> _ => {
                self.observe_cancel();
                Next::Cancelled
            }
        }
    }

    /// Items from the shared input queue, until it is closed and drained or
    /// the stage is cancelled. Once exhausted, later calls yield nothing.
    pub fn inputs(&self) -> Inputs<'_, I, O> {
        Inputs { worker: self }
    }

    /// Next input item, `Ok(None)` at end of stream, `Err(Cancelled)` on cancellation.
    pub fn next_input(&self) -> PipelineResult<Option<I>> {
        match self.next() {
            Next::Item(item) => Ok(Some(item)),
            Next::Closed => Ok(None),
            Next::Cancelled => Err(PipelineError::Cancelled),
        }
    }

    /// Push an item to the stage's output queue, blocking while it is full.
    pub fn emit(&self, item: O) -> PipelineResult<()> {
        if self.is_cancelled() {
            self.observe_cancel();
            return Err(PipelineError::Cancelled);
        }
        select! {
            send(self.output, item) -> res => match res {
                Ok(()) => {
                    self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => Err(PipelineError::config(format!(
                    "output of stage '{}' is disconnected",
                    self.stage_name
                ))),
            },
            recv(self.cancel.signal()) -> _ => {
                self.observe_cancel();
                Err(PipelineError::Cancelled)
            },
            recv(self.halt.signal()) -> _ => {
                self.observe_cancel();
                Err(PipelineError::Cancelled)
            }
        }
    }

    pub fn fields(&self) -> &FieldStore {
        &self.fields
    }

    pub fn get_field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// `None` when the field is absent or not an integer.
    pub fn get_field_int(&self, key: &str) -> Option<i64> {
        self.fields.get_int(key)
    }

    pub fn try_field_int(&self, key: &str) -> PipelineResult<i64> {
        self.fields.try_int(key)
    }

    pub fn get_field_bool(&self, key: &str) -> Option<bool> {
        self.fields.get_bool(key)
    }

    pub fn get_field_float(&self, key: &str) -> Option<f64> {
        self.fields.get_float(key)
    }

    pub fn get_field_str(&self, key: &str) -> Option<&str> {
        self.fields.get_str(key)
    }

    pub fn get_field_object<T: DeserializeOwned>(&self, key: &str) -> PipelineResult<T> {
        self.fields.get_object(key)
    }

    pub fn get_field_object_into<T: DeserializeOwned>(&self, key: &str, dest: &mut T) -> PipelineResult<()> {
        self.fields.get_object_into(key, dest)
    }
}

/// Iterator returned by [`Worker::inputs`].
pub struct Inputs<'a, I, O> {
    worker: &'a Worker<I, O>,
}

impl<I, O> Iterator for Inputs<'_, I, O> {
    type Item = I;

    fn next(&mut self) -> Option<I> {
        match self.worker.next() {
            Next::Item(item) => Some(item),
            Next::Closed | Next::Cancelled => None,
        }
    }
}
