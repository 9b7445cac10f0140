use std::sync::Arc;

use crate::error::{ExecError, Result};
use crate::pool::{Placement, Priority, Submission, TaskHandle, TaskValue, Work, WorkerId, WorkerPool};
use crate::scheduler::{Job, Task};

/// Submits tasks to a pool, honoring each task's locality constraint.
pub struct Dispatcher<'a> {
    pool: &'a dyn WorkerPool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(pool: &'a dyn WorkerPool) -> Self {
        Self { pool }
    }

    /// Submit every task of `job`, returning handles in task order.
    ///
    /// All placements are checked before the first submission, so a bad
    /// location set never reaches the pool. If the pool rejects a task
    /// midway, the handles already submitted for this job are cancelled.
    pub fn submit_job<J: Job>(&self, job: &J) -> Result<Vec<TaskHandle>> {
        let job_id = job.id();
        let tasks = job.tasks();
        let known = self.pool.workers();

        let placements = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| check_placement(index, task.locations(), &known))
            .collect::<Result<Vec<_>>>()?;

        let mut handles = Vec::with_capacity(tasks.len());
        for (index, (task, placement)) in tasks.into_iter().zip(placements).enumerate() {
            let submission =
                Submission::new(format!("{job_id}/{index}"), erase(task)).with_placement(placement);
            match self.pool.submit(submission) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        task_index = index,
                        submitted = handles.len(),
                        error = %e,
                        "Submission failed, cancelling the rest of the job"
                    );
                    self.pool.cancel(&handles);
                    return Err(e);
                }
            }
        }

        tracing::debug!(job_id = %job_id, tasks = handles.len(), "Job dispatched");
        Ok(handles)
    }

    /// Submit one ad-hoc callable ahead of ordinary job tasks.
    pub fn submit_function<F, R>(&self, name: impl Into<String>, func: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let work: Work = Box::new(move || func().map(|value| Box::new(value) as TaskValue));
        self.pool
            .submit(Submission::new(name, work).with_priority(Priority::High))
    }
}

/// Translate a task's declared locations into a placement.
///
/// An empty set fails with [`ExecError::NoEligibleWorkers`]; a set naming
/// only workers the pool does not have fails with
/// [`ExecError::UnknownWorkers`] since nothing could ever pick it up.
pub fn check_placement(
    task_index: usize,
    locations: Option<&[WorkerId]>,
    known: &[WorkerId],
) -> Result<Placement> {
    match locations {
        None => Ok(Placement::Anywhere),
        Some([]) => Err(ExecError::NoEligibleWorkers { task_index }),
        Some(workers) if !workers.iter().any(|w| known.contains(w)) => {
            Err(ExecError::UnknownWorkers {
                task_index,
                workers: workers.to_vec(),
            })
        }
        Some(workers) => Ok(Placement::Restricted(workers.to_vec())),
    }
}

fn erase<T: Task>(task: Arc<T>) -> Work {
    Box::new(move || task.run().map(|value| Box::new(value) as TaskValue))
}
