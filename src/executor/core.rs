use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::ConnectionConfig;
use crate::error::{ExecError, Result};
use crate::pool::{AsCompleted, Completed, PoolAddress, TaskHandle, TaskValue, WorkerId, WorkerPool};
use crate::scheduler::{Dispatcher, Job, JobId, JobTracker, Task};

/// Interval between registry lookups while `connect` waits for a pool.
pub(crate) const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// State and logic shared by the blocking and suspending executors.
///
/// Nothing in here waits: submission, tracking and cancellation return
/// immediately, and waiting for results happens in [`JobRun`] through
/// whichever consumption mode the adapter picks.
pub(crate) struct ExecutorCore {
    pool: RwLock<Option<Arc<dyn WorkerPool>>>,
    address: PoolAddress,
    local: bool,
    tracker: Arc<JobTracker>,
    closed: Arc<AtomicBool>,
    connection: ConnectionConfig,
}

impl ExecutorCore {
    pub fn new(pool: Arc<dyn WorkerPool>, local: bool, connection: ConnectionConfig) -> Self {
        tracing::info!(address = %pool.address(), local, "Executor attached to pool");
        Self {
            address: pool.address().clone(),
            pool: RwLock::new(Some(pool)),
            local,
            tracker: Arc::new(JobTracker::new()),
            closed: Arc::new(AtomicBool::new(false)),
            connection,
        }
    }

    pub fn address(&self) -> &PoolAddress {
        &self.address
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.tracker.running_jobs()
    }

    pub fn pool(&self) -> Result<Arc<dyn WorkerPool>> {
        match self.pool.read().as_ref() {
            Some(pool) if !pool.is_closed() => Ok(Arc::clone(pool)),
            Some(_) => Err(ExecError::PoolUnavailable(format!(
                "pool at {} has shut down",
                self.address
            ))),
            None => Err(ExecError::PoolUnavailable("executor is closed".to_string())),
        }
    }

    pub fn workers(&self) -> Result<Vec<WorkerId>> {
        Ok(self.pool()?.workers())
    }

    /// Dispatch every task of `job` and start tracking it.
    pub fn start_job<J: Job>(&self, job: &J) -> Result<JobRun<<J::Task as Task>::Output>> {
        let pool = self.pool()?;
        let job_id = job.id();
        self.tracker.reserve(job_id)?;
        if self.is_closed() {
            self.tracker.forget(job_id);
            return Err(closed_during_start());
        }

        let handles = match Dispatcher::new(pool.as_ref()).submit_job(job) {
            Ok(handles) => handles,
            Err(e) => {
                self.tracker.forget(job_id);
                return Err(e);
            }
        };

        // A close racing the dispatch drains the reservation or sets the flag
        let attached = self.tracker.attach(job_id, handles.clone());
        if !attached || self.is_closed() {
            pool.cancel(&handles);
            self.tracker.forget(job_id);
            tracing::warn!(job_id = %job_id, "Executor closed while the job was starting");
            return Err(closed_during_start());
        }

        tracing::info!(job_id = %job_id, tasks = handles.len(), "Job started");
        Ok(JobRun::new(
            job_id,
            handles,
            pool,
            Arc::clone(&self.tracker),
            Arc::clone(&self.closed),
        ))
    }

    pub fn submit_function<F, R>(&self, func: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool()?;
        let name = format!("function-{}", uuid::Uuid::new_v4().simple());
        Dispatcher::new(pool.as_ref()).submit_function(name, func)
    }

    /// Request cancellation of every outstanding task of a running job.
    ///
    /// Returns false, without side effects, if the job is not tracked.
    /// Does not wait for the cancellation to take effect.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let Some(handles) = self.tracker.lookup(job_id) else {
            tracing::debug!(job_id = %job_id, "Cancel requested for a job that is not running");
            return false;
        };

        let outstanding: Vec<TaskHandle> = handles.into_iter().filter(|h| !h.is_done()).collect();
        match self.pool() {
            Ok(pool) => pool.cancel(&outstanding),
            Err(_) => outstanding.iter().for_each(|h| {
                h.cancel();
            }),
        }
        tracing::info!(job_id = %job_id, cancelled = outstanding.len(), "Job cancelled");
        true
    }

    /// Detach from the pool and cancel every tracked job.
    ///
    /// Returns the pool if it still needs a teardown, i.e. this executor
    /// provisioned it. Safe to call more than once.
    pub fn begin_close(&self) -> Option<Arc<dyn WorkerPool>> {
        let Some(pool) = self.pool.write().take() else {
            tracing::error!(address = %self.address, "Close called on an executor with no open connection");
            return None;
        };
        self.closed.store(true, Ordering::SeqCst);

        let handles = self.tracker.drain();
        if !handles.is_empty() {
            pool.cancel(&handles);
        }
        tracing::info!(
            address = %self.address,
            local = self.local,
            cancelled = handles.len(),
            "Closing executor"
        );

        self.local.then_some(pool)
    }
}

fn closed_during_start() -> ExecError {
    ExecError::PoolUnavailable("executor was closed while the job was starting".to_string())
}

/// Tear down a locally provisioned pool. Failures are logged, never raised.
pub(crate) fn teardown(pool: Arc<dyn WorkerPool>, timeout: Duration) {
    match pool.shutdown(timeout) {
        Ok(()) => tracing::info!(address = %pool.address(), "Local pool torn down"),
        Err(ExecError::TeardownTimeout(waited)) => tracing::warn!(
            address = %pool.address(),
            timeout_ms = waited.as_millis() as u64,
            "Local pool teardown timed out"
        ),
        Err(e) => tracing::error!(address = %pool.address(), error = %e, "Local pool teardown failed"),
    }
}

/// Take the typed value out of a gathered result.
pub(crate) fn gather<R: 'static>(completed: Completed) -> Result<R> {
    completed.outcome.and_then(downcast::<R>)
}

fn downcast<R: 'static>(value: TaskValue) -> Result<R> {
    value.downcast::<R>().map(|value| *value).map_err(|_| {
        ExecError::Internal(format!(
            "task result is not a {}",
            std::any::type_name::<R>()
        ))
    })
}

/// Result sequence of one running job.
///
/// Yields each task's output as it completes. The first error ends the
/// sequence: outstanding tasks are cancelled and the job is forgotten. The
/// job is also forgotten once the last result was delivered, or when the
/// run is dropped early, in which case its outstanding tasks are cancelled.
pub(crate) struct JobRun<O> {
    job_id: JobId,
    stream: AsCompleted,
    handles: Vec<TaskHandle>,
    pool: Arc<dyn WorkerPool>,
    tracker: Arc<JobTracker>,
    closed: Arc<AtomicBool>,
    done: bool,
    _output: PhantomData<fn() -> O>,
}

impl<O: 'static> JobRun<O> {
    fn new(
        job_id: JobId,
        handles: Vec<TaskHandle>,
        pool: Arc<dyn WorkerPool>,
        tracker: Arc<JobTracker>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let mut run = Self {
            job_id,
            stream: AsCompleted::new(&handles),
            handles,
            pool,
            tracker,
            closed,
            done: false,
            _output: PhantomData,
        };
        if run.stream.is_exhausted() {
            run.finish();
        }
        run
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Results not yet delivered
    pub fn remaining(&self) -> usize {
        if self.done {
            0
        } else {
            self.stream.remaining()
        }
    }

    pub fn next_blocking(&mut self) -> Option<Result<O>> {
        if self.done {
            return None;
        }
        let completed = self.stream.next_blocking();
        self.deliver(completed)
    }

    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<O>>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.stream.poll_next_completed(cx) {
            Poll::Ready(completed) => Poll::Ready(self.deliver(completed)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn deliver(&mut self, completed: Option<Completed>) -> Option<Result<O>> {
        let Some(completed) = completed else {
            self.finish();
            return None;
        };

        match gather::<O>(completed) {
            Ok(value) => {
                if self.stream.is_exhausted() {
                    self.finish();
                }
                Some(Ok(value))
            }
            Err(e) => {
                let e = if e.is_cancelled() && self.closed.load(Ordering::SeqCst) {
                    ExecError::PoolUnavailable("executor was closed while the job ran".to_string())
                } else {
                    e
                };
                tracing::warn!(job_id = %self.job_id, error = %e, "Job stopped on task error");
                self.abort();
                Some(Err(e))
            }
        }
    }

    fn abort(&mut self) {
        let outstanding: Vec<TaskHandle> = self
            .handles
            .iter()
            .filter(|h| !h.is_done())
            .cloned()
            .collect();
        if !outstanding.is_empty() {
            self.pool.cancel(&outstanding);
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.tracker.forget(self.job_id);
        tracing::debug!(job_id = %self.job_id, "Job finished");
    }
}

impl<O> Drop for JobRun<O> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let outstanding: Vec<TaskHandle> = self
            .handles
            .iter()
            .filter(|h| !h.is_done())
            .cloned()
            .collect();
        tracing::debug!(
            job_id = %self.job_id,
            outstanding = outstanding.len(),
            "Results dropped before exhaustion, cancelling the rest of the job"
        );
        if !outstanding.is_empty() {
            self.pool.cancel(&outstanding);
        }
        self.tracker.forget(self.job_id);
    }
}
