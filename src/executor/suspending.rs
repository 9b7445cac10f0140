use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};

use crate::config::{ConnectionConfig, PoolConfig};
use crate::error::{ExecError, Result};
use crate::executor::core::{gather, teardown, ExecutorCore, JobRun, CONNECT_POLL_INTERVAL};
use crate::pool::{registry, AsCompleted, LocalCluster, PoolAddress, WorkerId, WorkerPool};
use crate::scheduler::{partition_job, Dataset, Job, JobId, Task};

/// Executor whose waiting points suspend the calling task instead of
/// blocking its thread.
///
/// Shares dispatch, tracking and cancellation with
/// [`JobExecutor`](crate::executor::JobExecutor); only the way results are
/// awaited differs.
#[derive(Clone)]
pub struct AsyncJobExecutor {
    core: Arc<ExecutorCore>,
}

impl AsyncJobExecutor {
    pub fn from_pool(pool: Arc<dyn WorkerPool>) -> Self {
        Self::with_core(ExecutorCore::new(pool, false, ConnectionConfig::default()))
    }

    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with(address, ConnectionConfig::default()).await
    }

    pub async fn connect_with(address: &str, connection: ConnectionConfig) -> Result<Self> {
        let address: PoolAddress = address.parse()?;
        let wait = connection.connect_timeout();

        let resolve = async {
            loop {
                if let Some(pool) = registry::lookup(&address) {
                    return pool;
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(wait, resolve).await {
            Ok(pool) => Ok(Self::with_core(ExecutorCore::new(pool, false, connection))),
            Err(_) => Err(ExecError::PoolUnavailable(format!(
                "no pool reachable at {address} within {wait:?}"
            ))),
        }
    }

    /// Provision a local pool owned by this executor. Thread startup runs
    /// on the blocking pool.
    pub async fn make_local(pool_config: PoolConfig, connection: ConnectionConfig) -> Result<Self> {
        let cluster = tokio::task::spawn_blocking(move || LocalCluster::start(pool_config))
            .await
            .map_err(|e| ExecError::Internal(format!("pool provisioning task failed: {e}")))??;
        let pool: Arc<dyn WorkerPool> = cluster;
        Ok(Self::with_core(ExecutorCore::new(pool, true, connection)))
    }

    fn with_core(core: ExecutorCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    pub fn address(&self) -> &PoolAddress {
        self.core.address()
    }

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

    /// Submit every task of `job` and return a stream of its results in
    /// completion order.
    ///
    /// Submission never waits, so this is not `async`; the stream suspends
    /// between results. A task cancelled while the stream is consumed yields
    /// [`ExecError::TaskCancelled`] and ends the stream.
    pub fn run_job<J: Job>(&self, job: &J) -> Result<AsyncJobResults<<J::Task as Task>::Output>> {
        let run = self.core.start_job(job)?;
        Ok(AsyncJobResults { run })
    }

    pub fn map_partitions<D, K, F, O>(
        &self,
        dataset: &D,
        func: F,
        kwargs: K,
    ) -> Result<AsyncJobResults<O>>
    where
        D: Dataset,
        K: Send + Sync + 'static,
        F: Fn(&D::Partition, &K) -> anyhow::Result<O> + Send + Sync + 'static,
        O: Send + 'static,
    {
        self.run_job(&partition_job(dataset, func, kwargs))
    }

    /// Run one callable at high priority and await its result.
    pub async fn run_function<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let handle = self.core.submit_function(func)?;
        let completed = AsCompleted::new([&handle])
            .next()
            .await
            .ok_or_else(|| ExecError::Internal(format!("task {} never completed", handle.key())))?;
        gather(completed)
    }

    pub fn cancel_job<J: Job>(&self, job: &J) -> bool {
        self.core.cancel_job(job.id())
    }

    pub fn cancel_job_id(&self, job_id: JobId) -> bool {
        self.core.cancel_job(job_id)
    }

    /// Release the pool connection. A locally provisioned pool is torn down
    /// on the blocking pool with a bounded wait; problems are logged.
    pub async fn close(&self) {
        let Some(pool) = self.core.begin_close() else {
            return;
        };
        let timeout = self.core.connection().teardown_timeout();
        if let Err(e) = tokio::task::spawn_blocking(move || teardown(pool, timeout)).await {
            tracing::error!(error = %e, "Pool teardown task failed");
        }
    }
}

impl std::fmt::Debug for AsyncJobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobExecutor")
            .field("address", self.core.address())
            .field("local", &self.core.is_local())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

/// Stream of a job's results, in completion order.
pub struct AsyncJobResults<O> {
    run: JobRun<O>,
}

impl<O: 'static> AsyncJobResults<O> {
    pub fn job_id(&self) -> JobId {
        self.run.job_id()
    }

    pub fn remaining(&self) -> usize {
        self.run.remaining()
    }
}

impl<O: 'static> Stream for AsyncJobResults<O> {
    type Item = Result<O>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().run.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.run.remaining()))
    }
}
