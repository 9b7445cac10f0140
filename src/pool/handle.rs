use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::error::TaskError;
use crate::pool::WorkerId;

/// Type-erased value produced by a task body.
pub type TaskValue = Box<dyn Any + Send>;

/// What a worker records once a task body returns.
pub type TaskOutcome = std::result::Result<TaskValue, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey(pub Uuid);

impl TaskKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Finished => write!(f, "finished"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

struct HandleState {
    status: TaskStatus,
    outcome: Option<TaskOutcome>,
    finished_at: Option<DateTime<Utc>>,
    listeners: Vec<UnboundedSender<TaskHandle>>,
}

struct HandleInner {
    key: TaskKey,
    name: String,
    worker: WorkerId,
    submitted_at: DateTime<Utc>,
    state: Mutex<HandleState>,
}

/// Shared reference to one submitted task.
///
/// Cloning is cheap; every clone observes the same state. The first
/// terminal transition wins: a task cancelled while running keeps its
/// `Cancelled` status and the late result is discarded, and cancelling
/// a task that already finished is a no-op.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub fn new(name: impl Into<String>, worker: WorkerId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                key: TaskKey::new(),
                name: name.into(),
                worker,
                submitted_at: Utc::now(),
                state: Mutex::new(HandleState {
                    status: TaskStatus::Pending,
                    outcome: None,
                    finished_at: None,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    pub fn key(&self) -> TaskKey {
        self.inner.key
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Worker the task was placed on
    pub fn worker(&self) -> &WorkerId {
        &self.inner.worker
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.inner.submitted_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().finished_at
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Move a pending task to running. Returns false if the task was
    /// cancelled (or already picked up) and must not be executed.
    pub fn mark_running(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.status != TaskStatus::Pending {
            return false;
        }
        state.status = TaskStatus::Running;
        true
    }

    /// Record the result of the task body. Returns false if the handle
    /// already reached a terminal state, in which case `outcome` is dropped.
    pub fn complete(&self, outcome: TaskOutcome) -> bool {
        let status = if outcome.is_ok() {
            TaskStatus::Finished
        } else {
            TaskStatus::Failed
        };
        self.finish(status, Some(outcome))
    }

    /// Request cancellation. Returns true if this call moved the task
    /// into the `Cancelled` state.
    pub fn cancel(&self) -> bool {
        self.finish(TaskStatus::Cancelled, None)
    }

    /// Take the recorded outcome. Only the first caller receives it.
    pub fn take_outcome(&self) -> Option<TaskOutcome> {
        self.inner.state.lock().outcome.take()
    }

    /// Register a channel that receives this handle once it is terminal.
    /// If it already is, the handle is sent right away.
    pub(crate) fn add_done_listener(&self, tx: UnboundedSender<TaskHandle>) {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() {
            drop(state);
            let _ = tx.send(self.clone());
        } else {
            state.listeners.push(tx);
        }
    }

    fn finish(&self, status: TaskStatus, outcome: Option<TaskOutcome>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.outcome = outcome;
            state.finished_at = Some(Utc::now());
            std::mem::take(&mut state.listeners)
        };

        for tx in listeners {
            // A dropped receiver means nobody is iterating any more.
            let _ = tx.send(self.clone());
        }
        true
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("key", &self.inner.key)
            .field("name", &self.inner.name)
            .field("worker", &self.inner.worker)
            .field("status", &self.status())
            .finish()
    }
}
