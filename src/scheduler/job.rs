use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::WorkerId;

/// Identity of one logical job. Two jobs are the same job iff their ids match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedulable unit of work bound to one partition of data.
pub trait Task: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Workers this task may run on. `None` means any worker; an empty
    /// slice is a configuration error, not "anywhere".
    fn locations(&self) -> Option<&[WorkerId]> {
        None
    }

    fn run(&self) -> anyhow::Result<Self::Output>;
}

/// An ordered group of tasks submitted and tracked as one unit.
pub trait Job {
    type Task: Task;

    fn id(&self) -> JobId;

    fn tasks(&self) -> Vec<Arc<Self::Task>>;
}

/// Stock [`Job`]: a fixed list of tasks with a fresh id.
pub struct TaskJob<T> {
    id: JobId,
    tasks: Vec<Arc<T>>,
    created_at: DateTime<Utc>,
}

impl<T: Task> TaskJob<T> {
    pub fn new(tasks: impl IntoIterator<Item = T>) -> Self {
        Self::from_shared(tasks.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(tasks: Vec<Arc<T>>) -> Self {
        Self {
            id: JobId::new(),
            tasks,
            created_at: Utc::now(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T: Task> Job for TaskJob<T> {
    type Task = T;

    fn id(&self) -> JobId {
        self.id
    }

    fn tasks(&self) -> Vec<Arc<T>> {
        self.tasks.clone()
    }
}

impl<T> fmt::Debug for TaskJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskJob")
            .field("id", &self.id)
            .field("tasks", &self.tasks.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// One slice of a dataset, carrying its own locality hints.
pub trait Partition: Send + Sync + 'static {
    fn locations(&self) -> Option<&[WorkerId]> {
        None
    }
}

pub trait Dataset {
    type Partition: Partition;

    fn partitions(&self) -> Vec<Arc<Self::Partition>>;
}

/// A function applied to one partition with shared keyword arguments.
pub struct PartitionTask<P, K, F, O> {
    partition: Arc<P>,
    kwargs: Arc<K>,
    func: Arc<F>,
    _output: PhantomData<fn() -> O>,
}

impl<P, K, F, O> PartitionTask<P, K, F, O> {
    pub fn partition(&self) -> &Arc<P> {
        &self.partition
    }
}

impl<P, K, F, O> Task for PartitionTask<P, K, F, O>
where
    P: Partition,
    K: Send + Sync + 'static,
    F: Fn(&P, &K) -> anyhow::Result<O> + Send + Sync + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn locations(&self) -> Option<&[WorkerId]> {
        self.partition.locations()
    }

    fn run(&self) -> anyhow::Result<O> {
        (self.func)(&self.partition, &self.kwargs)
    }
}

pub type PartitionJob<P, K, F, O> = TaskJob<PartitionTask<P, K, F, O>>;

/// Build the implicit job that applies `func` to every partition of `dataset`.
pub fn partition_job<D, K, F, O>(dataset: &D, func: F, kwargs: K) -> PartitionJob<D::Partition, K, F, O>
where
    D: Dataset,
    K: Send + Sync + 'static,
    F: Fn(&D::Partition, &K) -> anyhow::Result<O> + Send + Sync + 'static,
    O: Send + 'static,
{
    let func = Arc::new(func);
    let kwargs = Arc::new(kwargs);
    TaskJob::new(dataset.partitions().into_iter().map(|partition| PartitionTask {
        partition,
        kwargs: Arc::clone(&kwargs),
        func: Arc::clone(&func),
        _output: PhantomData,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(usize);

    impl Task for Echo {
        type Output = usize;

        fn run(&self) -> anyhow::Result<usize> {
            Ok(self.0)
        }
    }

    struct Chunk {
        rows: Vec<u32>,
        host: Vec<WorkerId>,
    }

    impl Partition for Chunk {
        fn locations(&self) -> Option<&[WorkerId]> {
            Some(&self.host)
        }
    }

    struct Table(Vec<Arc<Chunk>>);

    impl Dataset for Table {
        type Partition = Chunk;

        fn partitions(&self) -> Vec<Arc<Chunk>> {
            self.0.clone()
        }
    }

    #[test]
    fn task_job_keeps_order_and_has_unique_id() {
        let a = TaskJob::new((0..3).map(Echo));
        let b = TaskJob::new((0..3).map(Echo));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.len(), 3);

        let outputs: Vec<usize> = a.tasks().iter().map(|t| t.run().unwrap()).collect();
        assert_eq!(outputs, vec![0, 1, 2]);
        assert!(a.tasks()[0].locations().is_none());
    }

    #[test]
    fn partition_job_binds_function_and_kwargs() {
        let table = Table(vec![
            Arc::new(Chunk {
                rows: vec![1, 2, 3],
                host: vec![WorkerId::new("worker-0")],
            }),
            Arc::new(Chunk {
                rows: vec![10],
                host: vec![WorkerId::new("worker-1")],
            }),
        ]);

        let job = partition_job(
            &table,
            |chunk: &Chunk, scale: &u32| Ok(chunk.rows.iter().map(|r| r * scale).sum::<u32>()),
            2u32,
        );
        let tasks = job.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].run().unwrap(), 12);
        assert_eq!(tasks[1].run().unwrap(), 20);
        assert_eq!(tasks[1].locations().unwrap(), &[WorkerId::new("worker-1")]);
    }
}
