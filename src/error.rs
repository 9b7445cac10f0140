use std::time::Duration;

use thiserror::Error;

use crate::pool::{TaskKey, WorkerId};
use crate::scheduler::JobId;

/// Failure raised by a task body while it ran on a worker.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task failed: {0:#}")]
    Failed(#[source] anyhow::Error),

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("No workers found for task {task_index}: location set is empty")]
    NoEligibleWorkers { task_index: usize },

    #[error("Task {task_index} is pinned to workers not in the pool: {workers:?}")]
    UnknownWorkers {
        task_index: usize,
        workers: Vec<WorkerId>,
    },

    #[error("Job already running: {0}")]
    DuplicateJob(JobId),

    #[error("Task cancelled: {0}")]
    TaskCancelled(TaskKey),

    #[error("Worker pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Pool teardown did not finish within {0:?}")]
    TeardownTimeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::TaskCancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
