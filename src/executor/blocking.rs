use std::sync::Arc;
use std::time::Instant;

use crate::config::{ConnectionConfig, PoolConfig};
use crate::error::{ExecError, Result};
use crate::executor::core::{gather, teardown, ExecutorCore, JobRun, CONNECT_POLL_INTERVAL};
use crate::pool::{registry, AsCompleted, LocalCluster, PoolAddress, WorkerId, WorkerPool};
use crate::scheduler::{partition_job, Dataset, Job, JobId, Task};

/// Executor that blocks the calling thread while it waits on the pool.
///
/// Cloning is cheap and every clone drives the same connection, so one
/// thread can iterate a job's results while another cancels it.
///
/// The waiting calls park the OS thread and panic if made from inside an
/// async runtime; use [`AsyncJobExecutor`](crate::executor::AsyncJobExecutor)
/// there, or move the work onto `spawn_blocking`.
#[derive(Clone)]
pub struct JobExecutor {
    core: Arc<ExecutorCore>,
}

impl JobExecutor {
    /// Attach to an already running pool. `close` will not tear it down.
    pub fn from_pool(pool: Arc<dyn WorkerPool>) -> Self {
        Self::with_core(ExecutorCore::new(pool, false, ConnectionConfig::default()))
    }

    /// Attach to the pool published at `address`, waiting up to the
    /// default connect timeout for it to appear.
    pub fn connect(address: &str) -> Result<Self> {
        Self::connect_with(address, ConnectionConfig::default())
    }

    pub fn connect_with(address: &str, connection: ConnectionConfig) -> Result<Self> {
        let address: PoolAddress = address.parse()?;
        let deadline = Instant::now() + connection.connect_timeout();
        loop {
            if let Some(pool) = registry::lookup(&address) {
                return Ok(Self::with_core(ExecutorCore::new(pool, false, connection)));
            }
            if Instant::now() >= deadline {
                return Err(ExecError::PoolUnavailable(format!(
                    "no pool reachable at {address} within {:?}",
                    connection.connect_timeout()
                )));
            }
            std::thread::sleep(CONNECT_POLL_INTERVAL);
        }
    }

    /// Provision a local pool owned by this executor.
    pub fn make_local(pool_config: PoolConfig, connection: ConnectionConfig) -> Result<Self> {
        let cluster: Arc<dyn WorkerPool> = LocalCluster::start(pool_config)?;
        Ok(Self::with_core(ExecutorCore::new(cluster, true, connection)))
    }

    fn with_core(core: ExecutorCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub fn address(&self) -> &PoolAddress {
        self.core.address()
    }

    /// Whether this executor provisioned its pool
    pub fn is_local(&self) -> bool {
        self.core.is_local()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn workers(&self) -> Result<Vec<WorkerId>> {
        self.core.workers()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.core.running_jobs()
    }

    /// Submit every task of `job` and return its results in completion order.
    ///
    /// Submission happens before this returns; the iterator then blocks for
    /// each result. Dropping it early cancels the remaining tasks.
    pub fn run_job<J: Job>(&self, job: &J) -> Result<JobResults<<J::Task as Task>::Output>> {
        let run = self.core.start_job(job)?;
        Ok(JobResults { run })
    }

    /// Apply `func` to every partition of `dataset`, streaming results in
    /// completion order. Each partition's locality hints restrict where its
    /// task may run.
    pub fn map_partitions<D, K, F, O>(&self, dataset: &D, func: F, kwargs: K) -> Result<JobResults<O>>
    where
        D: Dataset,
        K: Send + Sync + 'static,
        F: Fn(&D::Partition, &K) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Send + 'static,
    {
        self.run_job(&partition_job(dataset, func, kwargs))
    }

    /// Run one callable at high priority and block until it returns.
    /// The callable's own error is passed through as [`ExecError::Task`].
    pub fn run_function<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let handle = self.core.submit_function(func)?;
        let completed = AsCompleted::new([&handle])
            .next_blocking()
            .ok_or_else(|| ExecError::Internal(format!("task {} never completed", handle.key())))?;
        gather(completed)
    }

    /// Cancel the outstanding tasks of a running job; no-op if it is not running.
    pub fn cancel_job<J: Job>(&self, job: &J) -> bool {
        self.core.cancel_job(job.id())
    }

    pub fn cancel_job_id(&self, job_id: JobId) -> bool {
        self.core.cancel_job(job_id)
    }

    /// Release the pool connection, tearing the pool down if this executor
    /// provisioned it. Teardown problems are logged, not returned.
    pub fn close(&self) {
        if let Some(pool) = self.core.begin_close() {
            teardown(pool, self.core.connection().teardown_timeout());
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("address", self.core.address())
            .field("local", &self.core.is_local())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

/// Blocking iterator over a job's results, in completion order.
pub struct JobResults<O> {
    run: JobRun<O>,
}

impl<O: 'static> JobResults<O> {
    pub fn job_id(&self) -> JobId {
        self.run.job_id()
    }

    pub fn remaining(&self) -> usize {
        self.run.remaining()
    }
}

impl<O: 'static> Iterator for JobResults<O> {
    type Item = Result<O>;

    fn next(&mut self) -> Option<Self::Item> {
        self.run.next_blocking()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.run.remaining()))
    }
}
