pub mod config;
pub mod error;
pub mod executor;
pub mod pool;
pub mod scheduler;
pub mod shutdown;
pub mod threading;

pub use config::{ConnectionConfig, PoolConfig};
pub use error::{ExecError, Result, TaskError};
pub use executor::{AsyncJobExecutor, AsyncJobResults, JobExecutor, JobResults};
pub use pool::{LocalCluster, Placement, PoolAddress, Priority, TaskHandle, WorkerId, WorkerPool};
pub use scheduler::{Dataset, Job, JobId, Partition, Task, TaskJob};
