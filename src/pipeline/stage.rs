//! Worker pools: a processing function run by N parallel threads over a
//! shared input queue.
//!
//! A stage is configured through [`StageBuilder`] and becomes an immutable
//! [`Stage`] handle once started. Lifecycle:
//!
//! ```text
//! StageBuilder ──start()──► Started ──close() / upstream done──► Draining ──join()──► Completed
//! ```
//!
//! # Output closure
//!
//! Every instance holds its own sender on the output queue and counts down the
//! stage's join latch when it exits. The instance that brings the latch to zero
//! closes the output queue. Consumers see the end of the stream only once every
//! instance has dropped its sender, so no emitted item can be cut off.
//!
//! # Ordering
//!
//! With `concurrency(1)` items leave a stage in the order they entered. With
//! more instances they race for input and output order is unspecified.
//!
//! # Backpressure
//!
//! Queues are bounded. A stage whose output is never consumed will block
//! once its output queue fills; callers must drain the last stage of a chain
//! (see [`Stage::outputs`]) or size capacities accordingly.

use crate::config::StageConfig;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::error::{
    FailureKind, InstanceFailure, JoinReport, PipelineError, PipelineResult, StageSendError,
};
use crate::pipeline::fields::{FieldStore, FieldValue};
use crate::pipeline::id::StageId;
use crate::pipeline::latch::CountdownLatch;
use crate::pipeline::queue::{QueueIter, StageQueue};
use crate::pipeline::worker::{StageCounters, Worker};
use serde::Serialize;
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default number of parallel instances per stage.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default queue slots per instance when no explicit capacity is set.
pub const DEFAULT_CAPACITY_PER_INSTANCE: usize = 2;

/// Signature of a processing function.
pub type ProcessFn<I, O> = dyn Fn(&Worker<I, O>) -> anyhow::Result<()> + Send + Sync;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unstarted,
    Started,
    Draining,
    Completed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Unstarted => write!(f, "unstarted"),
            StageState::Started => write!(f, "started"),
            StageState::Draining => write!(f, "draining"),
            StageState::Completed => write!(f, "completed"),
        }
    }
}

/// Point-in-time counters for a running stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageStats {
    pub items_received: u64,
    pub items_emitted: u64,
    pub running_instances: usize,
    pub input_buffered: usize,
    pub output_buffered: usize,
}

/// Static description of a stage, used by the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    pub concurrency: usize,
    pub upstream: Option<StageId>,
    pub input_capacity: usize,
    pub output_capacity: usize,
    pub state: StageState,
}

enum InstanceOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl InstanceOutcome {
    fn from_result(result: anyhow::Result<()>, cancel_observed: bool) -> Self {
        match result {
            Ok(()) if cancel_observed => InstanceOutcome::Cancelled,
            Ok(()) => InstanceOutcome::Completed,
            Err(err) => match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::Cancelled) => InstanceOutcome::Cancelled,
                _ => InstanceOutcome::Failed(format!("{:#}", err)),
            },
        }
    }
}

/// Counts the latch down when an instance exits, including by panic.
struct ExitGuard<O> {
    latch: Arc<CountdownLatch>,
    output: Arc<StageQueue<O>>,
    halt: CancelToken,
    stage_name: Arc<str>,
}

impl<O> Drop for ExitGuard<O> {
    fn drop(&mut self) {
        if self.latch.count_down() {
            self.output.close();
            // Wakes producers blocked on an input nobody reads any more.
            self.halt.cancel();
            tracing::debug!(stage = %self.stage_name, "All instances finished, output closed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Configuration for a stage that has not started yet.
pub struct StageBuilder<I, O> {
    id: StageId,
    name: String,
    cancel: CancelToken,
    process: Arc<ProcessFn<I, O>>,
    concurrency: usize,
    capacity: Option<usize>,
    fields: FieldStore,
    field_errors: Vec<String>,
    upstream: Option<(StageId, Arc<StageQueue<I>>)>,
    #[cfg(test)]
    fail_spawn_at: Option<usize>,
}

impl<I, O> StageBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn new<F>(name: impl Into<String>, cancel: CancelToken, process: F) -> Self
    where
        F: Fn(&Worker<I, O>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: StageId::next(),
            name: name.into(),
            cancel,
            process: Arc::new(process),
            concurrency: DEFAULT_CONCURRENCY,
            capacity: None,
            fields: FieldStore::new(),
            field_errors: Vec::new(),
            upstream: None,
            #[cfg(test)]
            fail_spawn_at: None,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    /// Always [`StageState::Unstarted`]; a builder has no running instances.
    pub fn state(&self) -> StageState {
        StageState::Unstarted
    }

    /// Number of parallel instances. Must be at least 1.
    pub fn concurrency(mut self, instances: usize) -> Self {
        self.concurrency = instances;
        self
    }

    /// Slots in each of the stage's own queues. Defaults to
    /// `concurrency * DEFAULT_CAPACITY_PER_INSTANCE`.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key, value);
        self
    }

    /// Attach a structured field. A serialization failure is reported by `start`.
    pub fn field_object<T: Serialize + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        if let Err(e) = self.fields.insert_object(key, value) {
            self.field_errors.push(e.to_string());
        }
        self
    }

    /// Apply concurrency, capacity and fields from a config entry.
    pub fn configure(mut self, config: &StageConfig) -> Self {
        if let Some(concurrency) = config.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(capacity) = config.capacity {
            self.capacity = Some(capacity);
        }
        for (key, value) in &config.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        self
    }

    /// Read from `upstream`'s output instead of a private input queue.
    ///
    /// A stage has a single upstream; calling this again replaces the link.
    pub fn link_from<P>(mut self, upstream: &Stage<P, I>) -> Self
    where
        P: Send + 'static,
    {
        if let Some((previous, _)) = &self.upstream {
            tracing::debug!(
                stage = %self.name,
                "Replacing upstream {} with {}",
                previous,
                upstream.id()
            );
        }
        self.upstream = Some((upstream.id(), upstream.inner.output.clone()));
        self
    }

    fn spawn_instance<F>(&self, instance: usize, body: F) -> io::Result<JoinHandle<InstanceOutcome>>
    where
        F: FnOnce() -> InstanceOutcome + Send + 'static,
    {
        #[cfg(test)]
        if self.fail_spawn_at == Some(instance) {
            return Err(io::Error::other("spawn refused"));
        }
        thread::Builder::new()
            .name(format!("{}-{}", self.name, instance))
            .spawn(body)
    }

    /// Validate the configuration and launch the instances.
    ///
    /// If a thread cannot be spawned, the instances already running are
    /// aborted and joined before the error is returned.
    pub fn start(mut self) -> PipelineResult<Stage<I, O>> {
        if self.concurrency == 0 {
            return Err(PipelineError::config(format!(
                "stage '{}' needs at least one instance",
                self.name
            )));
        }
        if self.capacity == Some(0) {
            return Err(PipelineError::config(format!(
                "stage '{}' queue capacity must be at least 1",
                self.name
            )));
        }
        if !self.field_errors.is_empty() {
            return Err(PipelineError::config(self.field_errors.join("; ")));
        }

        let capacity = self
            .capacity
            .unwrap_or(self.concurrency * DEFAULT_CAPACITY_PER_INSTANCE);
        let (input, upstream) = match self.upstream.take() {
            Some((id, queue)) => (queue, Some(id)),
            None => (Arc::new(StageQueue::bounded(capacity)), None),
        };
        let output = Arc::new(StageQueue::bounded(capacity));
        let output_tx = output.sender().ok_or_else(|| {
            PipelineError::config(format!("output of stage '{}' closed before start", self.name))
        })?;

        let stage_name: Arc<str> = Arc::from(self.name.as_str());
        let fields = Arc::new(std::mem::take(&mut self.fields));
        let halt = CancelToken::new();
        let latch = Arc::new(CountdownLatch::new(self.concurrency));
        let counters = Arc::new(StageCounters::default());
        let mut handles = Vec::with_capacity(self.concurrency);

        for instance in 0..self.concurrency {
            let worker = Worker::new(
                self.id,
                stage_name.clone(),
                instance,
                input.receiver(),
                output_tx.clone(),
                fields.clone(),
                self.cancel.clone(),
                halt.clone(),
                counters.clone(),
            );
            let guard = ExitGuard {
                latch: latch.clone(),
                output: output.clone(),
                halt: halt.clone(),
                stage_name: stage_name.clone(),
            };
            let process = self.process.clone();

            let spawned = self.spawn_instance(instance, move || {
                    let _guard = guard;
                    let worker = worker;
                    let span = tracing::debug_span!(
                        "instance",
                        stage = %worker.stage_name(),
                        instance = worker.instance()
                    );
                    let _enter = span.enter();
                    tracing::trace!("Instance started");
                    let result = process(&worker);
                    let outcome = InstanceOutcome::from_result(result, worker.cancel_observed());
                    if let InstanceOutcome::Failed(message) = &outcome {
                        tracing::warn!("Instance failed: {}", message);
                    }
                    outcome
                });

            match spawned {
                Ok(handle) => handles.push((instance, handle)),
                Err(e) => {
                    // The failed closure has already counted itself down.
                    for _ in instance + 1..self.concurrency {
                        latch.count_down();
                    }
                    if upstream.is_none() {
                        input.close();
                    }
                    halt.cancel();
                    for (_, handle) in handles.drain(..) {
                        let _ = handle.join();
                    }
                    tracing::warn!(
                        stage = %self.name,
                        "Failed to spawn instance {}: {}",
                        instance,
                        e
                    );
                    return Err(PipelineError::Spawn(e));
                }
            }
        }
        drop(output_tx);

        tracing::info!(
            stage = %self.name,
            id = %self.id,
            instances = self.concurrency,
            capacity,
            upstream = ?upstream,
            "Stage started"
        );

        Ok(Stage {
            inner: Arc::new(StageInner {
                id: self.id,
                name: self.name,
                concurrency: self.concurrency,
                input,
                output,
                upstream,
                cancel: self.cancel,
                halt,
                latch,
                counters,
                handles: Mutex::new(handles),
                joined: AtomicBool::new(false),
            }),
        })
    }
}

struct StageInner<I, O> {
    id: StageId,
    name: String,
    concurrency: usize,
    input: Arc<StageQueue<I>>,
    output: Arc<StageQueue<O>>,
    upstream: Option<StageId>,
    cancel: CancelToken,
    halt: CancelToken,
    latch: Arc<CountdownLatch>,
    counters: Arc<StageCounters>,
    handles: Mutex<Vec<(usize, JoinHandle<InstanceOutcome>)>>,
    joined: AtomicBool,
}

/// Handle to a started stage. Cheap to clone; all clones refer to the same
/// running instances.
pub struct Stage<I, O> {
    inner: Arc<StageInner<I, O>>,
}

impl<I, O> Clone for Stage<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Begin configuring a stage named `name` that runs `process` in each instance.
    pub fn builder<F>(name: impl Into<String>, cancel: CancelToken, process: F) -> StageBuilder<I, O>
    where
        F: Fn(&Worker<I, O>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        StageBuilder::new(name, cancel, process)
    }

    pub fn id(&self) -> StageId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Stage whose output feeds this one, if linked.
    pub fn upstream(&self) -> Option<StageId> {
        self.inner.upstream
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    pub fn state(&self) -> StageState {
        if self.inner.joined.load(Ordering::SeqCst) && self.inner.latch.remaining() == 0 {
            StageState::Completed
        } else if self.inner.input.is_closed() {
            StageState::Draining
        } else {
            StageState::Started
        }
    }

    pub fn stats(&self) -> StageStats {
        StageStats {
            items_received: self.inner.counters.received.load(Ordering::Relaxed),
            items_emitted: self.inner.counters.emitted.load(Ordering::Relaxed),
            running_instances: self.inner.latch.remaining(),
            input_buffered: self.inner.input.len(),
            output_buffered: self.inner.output.len(),
        }
    }

    pub fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            id: self.inner.id,
            name: self.inner.name.clone(),
            concurrency: self.inner.concurrency,
            upstream: self.inner.upstream,
            input_capacity: self.inner.input.capacity(),
            output_capacity: self.inner.output.capacity(),
            state: self.state(),
        }
    }

    fn linked_input_error(&self, upstream: StageId, action: &str) -> PipelineError {
        PipelineError::config(format!(
            "cannot {} stage '{}': its input is fed by {}",
            action, self.inner.name, upstream
        ))
    }

    /// Enqueue an item, blocking while the input queue is full.
    ///
    /// A blocked send gives up with `Cancelled` when the cancel token fires
    /// and with `Stopped` once every instance has exited.
    pub fn send(&self, item: I) -> Result<(), StageSendError<I>> {
        if let Some(upstream) = self.inner.upstream {
            return Err(StageSendError::new(
                item,
                self.linked_input_error(upstream, "send to"),
            ));
        }
        self.inner
            .input
            .send(item, &self.inner.cancel, &self.inner.halt)
    }

    /// Enqueue without blocking; fails with `QueueFull` under backpressure.
    pub fn try_send(&self, item: I) -> Result<(), StageSendError<I>> {
        if let Some(upstream) = self.inner.upstream {
            return Err(StageSendError::new(
                item,
                self.linked_input_error(upstream, "send to"),
            ));
        }
        self.inner
            .input
            .try_send(item, &self.inner.cancel, &self.inner.halt)
    }

    /// Signal that no more input will be sent. Allowed exactly once, and only
    /// on stages fed externally.
    pub fn close(&self) -> PipelineResult<()> {
        if let Some(upstream) = self.inner.upstream {
            return Err(self.linked_input_error(upstream, "close"));
        }
        if self.inner.input.close() {
            tracing::debug!(stage = %self.inner.name, "Input closed");
            Ok(())
        } else {
            Err(PipelineError::config(format!(
                "input of stage '{}' is already closed",
                self.inner.name
            )))
        }
    }

    /// Blocking iterator over the stage's output. Ends once every instance
    /// has finished and the queue is drained.
    pub fn outputs(&self) -> QueueIter<O> {
        self.inner.output.iter()
    }

    /// Wait for every instance to finish and aggregate their outcomes.
    pub fn join(&self) -> PipelineResult<()> {
        if self.inner.joined.swap(true, Ordering::SeqCst) {
            return Err(self.already_joined());
        }
        self.inner.latch.wait();
        self.collect_outcomes()
    }

    /// Like [`join`](Self::join) but gives up after `timeout`, leaving the
    /// stage joinable.
    pub fn join_timeout(&self, timeout: Duration) -> PipelineResult<()> {
        if self.inner.joined.load(Ordering::SeqCst) {
            return Err(self.already_joined());
        }
        if !self.inner.latch.wait_timeout(timeout) {
            return Err(PipelineError::Timeout(format!(
                "stage '{}' still has {} running instance(s) after {:?}",
                self.inner.name,
                self.inner.latch.remaining(),
                timeout
            )));
        }
        if self.inner.joined.swap(true, Ordering::SeqCst) {
            return Err(self.already_joined());
        }
        self.collect_outcomes()
    }

    fn already_joined(&self) -> PipelineError {
        PipelineError::config(format!("stage '{}' was already joined", self.inner.name))
    }

    fn collect_outcomes(&self) -> PipelineResult<()> {
        let handles = match self.inner.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut failures = Vec::new();
        for (instance, handle) in handles {
            let (kind, message) = match handle.join() {
                Ok(InstanceOutcome::Completed) => continue,
                Ok(InstanceOutcome::Cancelled) => (FailureKind::Cancelled, "cancelled".to_string()),
                Ok(InstanceOutcome::Failed(message)) => (FailureKind::Processing, message),
                Err(payload) => (FailureKind::Panicked, panic_message(payload.as_ref())),
            };
            failures.push(InstanceFailure {
                instance,
                kind,
                message,
            });
        }

        if failures.is_empty() {
            tracing::info!(stage = %self.inner.name, "Stage completed");
            Ok(())
        } else {
            tracing::warn!(
                stage = %self.inner.name,
                "{} of {} instances failed",
                failures.len(),
                self.inner.concurrency
            );
            Err(JoinReport {
                stage: self.inner.id,
                stage_name: self.inner.name.clone(),
                instances: self.inner.concurrency,
                failures,
            }
            .into())
        }
    }
}

impl<I, O> std::fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.concurrency)
            .field("upstream", &self.inner.upstream)
            .finish()
    }
}
