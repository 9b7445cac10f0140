pub mod dispatcher;
pub mod job;
pub mod tracker;

pub use dispatcher::Dispatcher;
pub use job::{partition_job, Dataset, Job, JobId, Partition, PartitionJob, PartitionTask, Task, TaskJob};
pub use tracker::JobTracker;
