//! Bounded multi-producer/multi-consumer queue connecting stages.
//!
//! A `StageQueue` owns one "master" sender and one receiver. Producers work
//! with cloned senders, consumers with cloned receivers. Closing the queue
//! drops the master sender exactly once; consumers observe the end of the
//! stream after the last outstanding sender clone is gone and the buffer is
//! drained.
//!
//! Linked stages share the same `Arc<StageQueue<T>>`: the upstream's output
//! queue *is* the downstream's input queue.

use crate::pipeline::cancel::CancelToken;
use crate::pipeline::error::{PipelineError, StageSendError};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

pub struct StageQueue<T> {
    capacity: usize,
    sender: Mutex<Option<Sender<T>>>,
    receiver: Receiver<T>,
    closed: AtomicBool,
}

impl<T> StageQueue<T> {
    /// Create an open queue buffering at most `capacity` items (minimum 1).
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            capacity,
            sender: Mutex::new(Some(tx)),
            receiver: rx,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently buffered.
    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether `close` has been called. Items may still be buffered.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<Sender<T>>> {
        match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A producer handle, or `None` once the queue is closed.
    pub(crate) fn sender(&self) -> Option<Sender<T>> {
        self.lock_sender().clone()
    }

    /// A consumer handle. Valid for the lifetime of the channel.
    pub(crate) fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }

    /// Drop the master sender. Returns `true` only for the call that closed
    /// the queue; later calls observe `false` and change nothing.
    pub(crate) fn close(&self) -> bool {
        let sender = self.lock_sender().take();
        match sender {
            Some(tx) => {
                self.closed.store(true, Ordering::SeqCst);
                drop(tx);
                true
            }
            None => false,
        }
    }

    /// Blocking enqueue that gives up when `cancel` fires (`Cancelled`) or
    /// when `halt` fires because no consumer remains (`Stopped`). A closed
    /// queue reports `InputClosed` ahead of either. The lock is released
    /// before blocking so a full queue never stalls `close`.
    pub(crate) fn send(
        &self,
        item: T,
        cancel: &CancelToken,
        halt: &CancelToken,
    ) -> Result<(), StageSendError<T>> {
        let Some(tx) = self.sender() else {
            return Err(StageSendError::new(item, PipelineError::InputClosed));
        };
        if let Some(reason) = interrupted(cancel, halt) {
            return Err(StageSendError::new(item, reason));
        }
        select! {
            send(tx, item) -> res => res
                .map_err(|e| StageSendError::new(e.into_inner(), PipelineError::InputClosed)),
            recv(cancel.signal()) -> _ => Err(StageSendError::new(item, PipelineError::Cancelled)),
            recv(halt.signal()) -> _ => Err(StageSendError::new(item, PipelineError::Stopped)),
        }
    }

    /// Non-blocking enqueue.
    pub(crate) fn try_send(
        &self,
        item: T,
        cancel: &CancelToken,
        halt: &CancelToken,
    ) -> Result<(), StageSendError<T>> {
        let Some(tx) = self.sender() else {
            return Err(StageSendError::new(item, PipelineError::InputClosed));
        };
        if let Some(reason) = interrupted(cancel, halt) {
            return Err(StageSendError::new(item, reason));
        }
        tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => StageSendError::new(item, PipelineError::QueueFull),
            TrySendError::Disconnected(item) => {
                StageSendError::new(item, PipelineError::InputClosed)
            }
        })
    }

    /// Blocking iterator that ends when the queue is closed and drained.
    pub fn iter(&self) -> QueueIter<T> {
        QueueIter {
            receiver: self.receiver(),
        }
    }
}

fn interrupted(cancel: &CancelToken, halt: &CancelToken) -> Option<PipelineError> {
    if cancel.is_cancelled() {
        Some(PipelineError::Cancelled)
    } else if halt.is_cancelled() {
        Some(PipelineError::Stopped)
    } else {
        None
    }
}

impl<T> std::fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owning iterator over a queue's remaining items.
pub struct QueueIter<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for QueueIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}
