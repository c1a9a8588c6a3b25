//! Worker threads: take a message, run it in one unit of work, resubmit its continuation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info_span};

use collectionjobs_core::JobId;

use super::error::{EngineError, JobError};
use super::message::{Dispatched, Dispatcher, Message};
use super::queue::WorkQueue;
use crate::storage::{with_unit_of_work, Storage};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop once it finishes its current message.
    pub(crate) fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait for the worker thread to exit.
    pub(crate) fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

/// Counters shared by every worker of one engine.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) batches_processed: AtomicU64,
    pub(crate) batches_failed: AtomicU64,
    pub(crate) continuations: AtomicU64,
    pub(crate) unknown_messages: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a worker thread needs.
pub(crate) struct WorkerContext<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) counters: Arc<Counters>,
    pub(crate) poll_interval: Duration,
}

/// Spawn a named worker thread pulling from the context's queue.
pub(crate) fn spawn<S: Storage>(
    name: String,
    ctx: WorkerContext<S>,
) -> Result<WorkerHandle, EngineError> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(ctx, shutdown_rx))?;

    Ok(WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

fn worker_loop<S: Storage>(ctx: WorkerContext<S>, shutdown_rx: mpsc::Receiver<()>) {
    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let Some(message) = ctx.queue.next(ctx.poll_interval) else {
            continue;
        };

        let mut in_flight = InFlight {
            queue: &ctx.queue,
            id: message.id,
            continued: false,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| process(&ctx, message))) {
            Ok(continued) => in_flight.continued = continued,
            Err(_) => {
                Counters::bump(&ctx.counters.batches_failed);
                error!(job_id = %in_flight.id, "job handler panicked; unit of work rolled back");
            }
        }
    }
}

/// Marks the message done when dropped.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    id: JobId,
    continued: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.task_done(self.id, self.continued);
    }
}

/// Run one message in its own unit of work. Returns true if a continuation was queued.
fn process<S: Storage>(ctx: &WorkerContext<S>, message: Message) -> bool {
    let span = info_span!(
        "job_batch",
        job_id = %message.id,
        message_type = %message.message_type
    );
    let _entered = span.enter();

    let outcome = with_unit_of_work(ctx.storage.as_ref(), |session| {
        ctx.dispatcher.dispatch(&message, session)
    });

    match outcome {
        Ok(Dispatched::Continue(next)) => {
            Counters::bump(&ctx.counters.batches_processed);
            Counters::bump(&ctx.counters.continuations);
            debug!("batch committed; resubmitting");
            ctx.queue.requeue(next);
            true
        }
        Ok(Dispatched::Done) => {
            Counters::bump(&ctx.counters.batches_processed);
            debug!("job finished");
            false
        }
        Ok(Dispatched::Unknown) => {
            Counters::bump(&ctx.counters.unknown_messages);
            false
        }
        Err(err) => {
            Counters::bump(&ctx.counters.batches_failed);
            log_failure(&err);
            false
        }
    }
}

fn log_failure(err: &JobError) {
    error!(error = %err, "job batch failed; unit of work rolled back");
}
