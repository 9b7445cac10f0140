use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::pool::{Priority, TaskHandle, TaskKey, TaskOutcome, Work, WorkerId};
use crate::threading;

pub(crate) struct Queued {
    pub priority: Priority,
    pub seq: u64,
    pub handle: TaskHandle,
    pub work: Work,
}

// Max-heap order: higher priority first, then lower sequence number.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    closed: bool,
}

/// One worker: a priority queue drained by its execution threads.
pub(crate) struct Worker {
    pub id: WorkerId,
    state: Mutex<QueueState>,
    ready: Condvar,
    /// Queued plus running submissions
    load: AtomicUsize,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            load: AtomicUsize::new(0),
        }
    }

    pub fn load(&self) -> usize {
        self.load.load(AtomicOrdering::Relaxed)
    }

    /// Returns the item back if the worker no longer accepts work.
    pub fn push(&self, item: Queued) -> Result<(), Queued> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.heap.push(item);
        self.load.fetch_add(1, AtomicOrdering::Relaxed);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until work is available. `None` once the worker is closed.
    fn next(&self) -> Option<Queued> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.heap.pop() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Stop accepting work and hand back everything still queued.
    pub fn close(&self) -> Vec<Queued> {
        let mut state = self.state.lock();
        state.closed = true;
        let drained: Vec<Queued> = std::mem::take(&mut state.heap).into_vec();
        self.load.fetch_sub(drained.len(), AtomicOrdering::Relaxed);
        drop(state);
        self.ready.notify_all();
        drained
    }
}

/// Counts execution threads that have not exited yet.
#[derive(Default)]
pub(crate) struct LiveThreads {
    count: Mutex<usize>,
    exited: Condvar,
}

impl LiveThreads {
    pub fn enter(self: &Arc<Self>) -> LiveThreadGuard {
        *self.count.lock() += 1;
        LiveThreadGuard {
            live: Arc::clone(self),
        }
    }

    /// Wait until every thread exited. Returns false on timeout.
    pub fn wait_all(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return true;
        }
        !self
            .exited
            .wait_while_for(&mut count, |count| *count > 0, timeout)
            .timed_out()
    }
}

pub(crate) struct LiveThreadGuard {
    live: Arc<LiveThreads>,
}

impl Drop for LiveThreadGuard {
    fn drop(&mut self) {
        let mut count = self.live.count.lock();
        *count -= 1;
        if *count == 0 {
            self.live.exited.notify_all();
        }
    }
}

/// Body of one execution thread.
pub(crate) fn run_worker_thread(
    worker: Arc<Worker>,
    inflight: Arc<DashMap<TaskKey, TaskHandle>>,
    task_threads: usize,
    _live: LiveThreadGuard,
) {
    tracing::debug!(worker = %worker.id, "Worker thread started");

    while let Some(item) = worker.next() {
        let key = item.handle.key();
        execute(&worker.id, item, task_threads);
        inflight.remove(&key);
        worker.load.fetch_sub(1, AtomicOrdering::Relaxed);
    }

    tracing::debug!(worker = %worker.id, "Worker thread exiting");
}

fn execute(worker: &WorkerId, item: Queued, task_threads: usize) {
    let Queued { handle, work, .. } = item;

    if !handle.mark_running() {
        tracing::trace!(task = %handle.key(), worker = %worker, "Skipping cancelled task");
        return;
    }

    let outcome: TaskOutcome = {
        let _threads = threading::set_num_threads(task_threads);
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Failed(e)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    };

    if let Err(ref e) = outcome {
        tracing::debug!(task = %handle.key(), worker = %worker, error = %e, "Task failed");
    }

    if !handle.complete(outcome) {
        tracing::debug!(
            task = %handle.key(),
            worker = %worker,
            "Task was cancelled while running, result discarded"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
