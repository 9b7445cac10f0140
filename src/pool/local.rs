use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{ExecError, Result};
use crate::pool::registry;
use crate::pool::worker::{run_worker_thread, LiveThreads, Queued, Worker};
use crate::pool::{Placement, PoolAddress, Submission, TaskHandle, TaskKey, WorkerId, WorkerPool};

/// In-process pool of named workers.
///
/// Each worker owns a priority queue and `threads_per_worker` execution
/// threads. Submissions go to the least loaded worker that their placement
/// allows. The pool publishes itself under its address for the lifetime of
/// the cluster so other executors can `connect` to it.
pub struct LocalCluster {
    address: PoolAddress,
    config: PoolConfig,
    workers: Vec<Arc<Worker>>,
    inflight: Arc<DashMap<TaskKey, TaskHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    live: Arc<LiveThreads>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl LocalCluster {
    /// Provision the workers and publish the pool.
    pub fn start(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("local-{}", Uuid::new_v4().simple()));
        let address = PoolAddress::inproc(&name);

        let workers: Vec<Arc<Worker>> = (0..config.n_workers)
            .map(|i| {
                Arc::new(Worker::new(WorkerId::new(format!(
                    "{}-{}",
                    config.worker_prefix, i
                ))))
            })
            .collect();

        let cluster = Arc::new(Self {
            address,
            config,
            workers,
            inflight: Arc::new(DashMap::new()),
            threads: Mutex::new(Vec::new()),
            live: Arc::new(LiveThreads::default()),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = cluster.spawn_threads() {
            cluster.close_queues();
            return Err(e);
        }

        let pool: Arc<dyn WorkerPool> = cluster.clone();
        if let Err(e) = registry::publish(&pool) {
            cluster.close_queues();
            return Err(e);
        }

        tracing::info!(
            address = %cluster.address,
            workers = cluster.config.n_workers,
            threads_per_worker = cluster.config.threads_per_worker,
            "Local cluster started"
        );
        Ok(cluster)
    }

    fn spawn_threads(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        for worker in &self.workers {
            for t in 0..self.config.threads_per_worker {
                let worker_ref = Arc::clone(worker);
                let inflight = Arc::clone(&self.inflight);
                let task_threads = self.config.task_threads;
                let live = self.live.enter();
                let handle = thread::Builder::new()
                    .name(format!("{}-t{}", worker.id, t))
                    .spawn(move || run_worker_thread(worker_ref, inflight, task_threads, live))
                    .map_err(|e| {
                        ExecError::Internal(format!(
                            "failed to spawn thread for {}: {}",
                            worker.id, e
                        ))
                    })?;
                threads.push(handle);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Submissions queued or running right now
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Least loaded worker the placement allows; ties go to the lowest index.
    fn pick_worker(&self, placement: &Placement) -> Option<&Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| placement.allows(&w.id))
            .min_by_key(|w| w.load())
    }

    fn close_queues(&self) -> usize {
        let mut cancelled = 0;
        for worker in &self.workers {
            for item in worker.close() {
                self.inflight.remove(&item.handle.key());
                if item.handle.cancel() {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }
}

impl WorkerPool for LocalCluster {
    fn address(&self) -> &PoolAddress {
        &self.address
    }

    fn workers(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    fn submit(&self, submission: Submission) -> Result<TaskHandle> {
        if self.is_closed() {
            return Err(ExecError::PoolUnavailable(format!(
                "pool at {} is closed",
                self.address
            )));
        }

        let Submission {
            name,
            work,
            placement,
            priority,
        } = submission;

        let worker = self.pick_worker(&placement).ok_or_else(|| {
            ExecError::PoolUnavailable(format!(
                "no worker in {} matches placement {:?}",
                self.address, placement
            ))
        })?;

        let handle = TaskHandle::new(name, worker.id.clone());
        self.inflight.insert(handle.key(), handle.clone());

        let item = Queued {
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            handle: handle.clone(),
            work,
        };
        if worker.push(item).is_err() {
            self.inflight.remove(&handle.key());
            handle.cancel();
            return Err(ExecError::PoolUnavailable(format!(
                "pool at {} is closed",
                self.address
            )));
        }

        tracing::debug!(
            task = %handle.key(),
            name = handle.name(),
            worker = %worker.id,
            priority = ?priority,
            "Task submitted"
        );
        Ok(handle)
    }

    fn cancel(&self, handles: &[TaskHandle]) {
        let cancelled = handles.iter().filter(|h| h.cancel()).count();
        if cancelled > 0 {
            tracing::debug!(address = %self.address, cancelled, "Tasks cancelled");
        }
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        registry::unpublish(&self.address, self as *const Self);

        let mut cancelled = self.close_queues();
        for entry in self.inflight.iter() {
            if entry.value().cancel() {
                cancelled += 1;
            }
        }
        tracing::info!(address = %self.address, cancelled, "Shutting down local cluster");

        if !self.live.wait_all(timeout) {
            tracing::warn!(
                address = %self.address,
                timeout_ms = timeout.as_millis() as u64,
                "Worker threads still busy after teardown timeout, detaching"
            );
            return Err(ExecError::TeardownTimeout(timeout));
        }

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!(address = %self.address, "Worker thread panicked");
            }
        }
        tracing::info!(address = %self.address, "Local cluster stopped");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            registry::unpublish(&self.address, self as *const Self);
            self.close_queues();
            for entry in self.inflight.iter() {
                entry.value().cancel();
            }
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("address", &self.address)
            .field("workers", &self.workers().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{AsCompleted, Priority, TaskStatus, TaskValue};
    use std::sync::mpsc;

    fn value<T: Send + 'static>(v: T) -> anyhow::Result<TaskValue> {
        Ok(Box::new(v))
    }

    fn cluster(n: usize) -> Arc<LocalCluster> {
        LocalCluster::start(PoolConfig::new(n)).unwrap()
    }

    fn wait_for_status(handle: &TaskHandle, status: TaskStatus) {
        for _ in 0..500 {
            if handle.status() == status {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("task never reached {status}");
    }

    #[test]
    fn start_names_workers_and_publishes() {
        let c = LocalCluster::start(PoolConfig::new(3).with_worker_prefix("node")).unwrap();
        let ids: Vec<String> = c.workers().iter().map(|w| w.to_string()).collect();
        assert_eq!(ids, vec!["node-0", "node-1", "node-2"]);
        assert!(registry::lookup(c.address()).is_some());

        c.shutdown(Duration::from_secs(5)).unwrap();
        assert!(c.is_closed());
        assert!(registry::lookup(c.address()).is_none());
    }

    #[test]
    fn duplicate_name_is_rejected_while_live() {
        let name = format!("dup-{}", Uuid::new_v4().simple());
        let a = LocalCluster::start(PoolConfig::new(1).with_name(&name)).unwrap();
        let err = LocalCluster::start(PoolConfig::new(1).with_name(&name)).unwrap_err();
        assert!(matches!(err, ExecError::InvalidConfig(_)));

        a.shutdown(Duration::from_secs(5)).unwrap();
        let b = LocalCluster::start(PoolConfig::new(1).with_name(&name)).unwrap();
        b.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn restricted_submission_runs_on_allowed_worker() {
        let c = cluster(3);
        let target = WorkerId::new("worker-2");
        let handle = c
            .submit(
                Submission::new(
                    "pinned",
                    Box::new(|| value(thread::current().name().map(str::to_string))),
                )
                .with_placement(Placement::Restricted(vec![target.clone()])),
            )
            .unwrap();
        assert_eq!(handle.worker(), &target);

        let mut stream = AsCompleted::new([&handle]);
        let done = stream.next_blocking().unwrap();
        let name = *done.outcome.unwrap().downcast::<Option<String>>().unwrap();
        assert!(name.unwrap().starts_with("worker-2-"));

        c.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn high_priority_jumps_the_queue() {
        let c = cluster(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker = c
            .submit(Submission::new(
                "blocker",
                Box::new(move || {
                    let _ = release_rx.recv();
                    value(())
                }),
            ))
            .unwrap();

        let mut handles = vec![blocker];
        for (label, priority) in [
            ("normal-0", Priority::Normal),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
        ] {
            let order = Arc::clone(&order);
            handles.push(
                c.submit(
                    Submission::new(
                        label,
                        Box::new(move || {
                            order.lock().push(label);
                            value(())
                        }),
                    )
                    .with_priority(priority),
                )
                .unwrap(),
            );
        }

        release_tx.send(()).unwrap();
        let mut stream = AsCompleted::new(&handles);
        while stream.next_blocking().is_some() {}

        assert_eq!(*order.lock(), vec!["high", "normal-0", "normal-1"]);
        c.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn least_loaded_worker_is_chosen() {
        let c = cluster(2);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let first = c
            .submit(Submission::new(
                "busy",
                Box::new(move || {
                    let _ = release_rx.recv();
                    value(())
                }),
            ))
            .unwrap();
        let second = c
            .submit(Submission::new("free", Box::new(|| value(()))))
            .unwrap();
        assert_ne!(first.worker(), second.worker());

        release_tx.send(()).unwrap();
        let mut stream = AsCompleted::new([&first, &second]);
        while stream.next_blocking().is_some() {}
        c.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn shutdown_cancels_queued_work_and_rejects_new_submissions() {
        let c = cluster(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let running = c
            .submit(Submission::new(
                "running",
                Box::new(move || {
                    let _ = release_rx.recv();
                    value(())
                }),
            ))
            .unwrap();
        let queued = c
            .submit(Submission::new("queued", Box::new(|| value(()))))
            .unwrap();
        wait_for_status(&running, TaskStatus::Running);

        let err = c.shutdown(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ExecError::TeardownTimeout(_)));
        assert_eq!(queued.status(), TaskStatus::Cancelled);
        assert_eq!(running.status(), TaskStatus::Cancelled);

        let rejected = c.submit(Submission::new("late", Box::new(|| value(()))));
        assert!(matches!(rejected, Err(ExecError::PoolUnavailable(_))));

        release_tx.send(()).unwrap();
        assert!(c.shutdown(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn task_threads_budget_is_applied() {
        let c = LocalCluster::start(PoolConfig::new(1).with_task_threads(3)).unwrap();
        let handle = c
            .submit(Submission::new(
                "budget",
                Box::new(|| value(crate::threading::num_threads())),
            ))
            .unwrap();
        let mut stream = AsCompleted::new([&handle]);
        let n = *stream
            .next_blocking()
            .unwrap()
            .outcome
            .unwrap()
            .downcast::<usize>()
            .unwrap();
        assert_eq!(n, 3);
        c.shutdown(Duration::from_secs(5)).unwrap();
    }
}
