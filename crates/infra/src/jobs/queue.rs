//! Unbounded in-memory FIFO shared by the worker pool.
//!
//! Besides the pending messages the queue tracks an outstanding-work count: a message
//! counts from the moment it is submitted until a worker has finished with it. Workers
//! requeue a continuation *before* marking their own message done, so the count only
//! reaches zero once every job has stopped producing work. Shutdown drains on this
//! count, not on the queue being momentarily empty.
//!
//! There is no backpressure. A producer that outpaces the workers grows the queue
//! without bound.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use collectionjobs_core::JobId;

use super::error::EngineError;
use super::message::Message;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Message>,
    /// Submitted and not yet marked done.
    outstanding: usize,
    /// Jobs with a message pending or being processed.
    live: HashSet<JobId>,
    /// Closed queues refuse new jobs but still accept continuations.
    closed: bool,
}

/// Work queue with drain support.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    drained: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the first message of a job. Never blocks on workers.
    ///
    /// Rejected when the queue is closed or the job already has a message in flight.
    pub fn submit(&self, message: Message) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::ShutDown);
        }
        if !state.live.insert(message.id) {
            return Err(EngineError::JobAlreadyQueued(message.id));
        }
        state.outstanding += 1;
        state.pending.push_back(message);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Enqueue a continuation produced by a worker for a job it is still processing.
    pub(crate) fn requeue(&self, message: Message) {
        let mut state = self.lock();
        state.live.insert(message.id);
        state.outstanding += 1;
        state.pending.push_back(message);
        drop(state);

        self.available.notify_one();
    }

    /// Take the next message, waiting up to `timeout` for one to arrive.
    pub(crate) fn next(&self, timeout: Duration) -> Option<Message> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |state| state.pending.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        state.pending.pop_front()
    }

    /// Mark one message as fully processed.
    ///
    /// `continued` is true when the worker already requeued a continuation for the
    /// same job, which keeps the job live.
    pub(crate) fn task_done(&self, id: JobId, continued: bool) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if !continued {
            state.live.remove(&id);
        }
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Stop accepting new jobs. Continuations of running jobs are still accepted.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    /// Block until every submitted message, and everything it caused to be
    /// requeued, has been processed.
    pub fn wait_drained(&self) {
        let state = self.lock();
        let _state = self
            .drained
            .wait_while(state, |state| state.outstanding > 0)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Messages submitted and not yet marked done.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Messages waiting for a worker.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_live(&self, id: JobId) -> bool {
        self.lock().live.contains(&id)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking handler never holds this lock, so the state stays consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
