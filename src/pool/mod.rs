//! Worker-pool boundary.
//!
//! The executor never runs task bodies itself. It talks to a pool through the
//! [`WorkerPool`] capability trait: submit a unit of work with a placement
//! constraint, cancel handles, and shut the pool down. [`LocalCluster`] is the
//! in-process implementation used by `make_local`; pools are reachable by
//! other executors through their [`PoolAddress`].
//!
//! # Components
//!
//! - [`handle`]: shared per-task state ([`TaskHandle`])
//! - [`completion`]: completion-ordered iteration ([`AsCompleted`])
//! - [`local`]: locally provisioned pool of named workers
//! - [`registry`]: address namespace consulted by `connect`

pub mod completion;
pub mod handle;
pub mod local;
pub mod registry;
mod worker;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, Result};

pub use completion::{AsCompleted, Completed};
pub use handle::{TaskHandle, TaskKey, TaskOutcome, TaskStatus, TaskValue};
pub use local::LocalCluster;

/// Identity of one worker in a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which workers may run a submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Anywhere,
    /// Only the listed workers; never empty
    Restricted(Vec<WorkerId>),
}

impl Placement {
    pub fn allows(&self, worker: &WorkerId) -> bool {
        match self {
            Placement::Anywhere => true,
            Placement::Restricted(workers) => workers.contains(worker),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Runs ahead of every queued `Normal` submission on its worker
    High,
}

/// Type-erased unit of work handed to a pool.
pub type Work = Box<dyn FnOnce() -> anyhow::Result<TaskValue> + Send + 'static>;

pub struct Submission {
    pub name: String,
    pub work: Work,
    pub placement: Placement,
    pub priority: Priority,
}

impl Submission {
    pub fn new(name: impl Into<String>, work: Work) -> Self {
        Self {
            name: name.into(),
            work,
            placement: Placement::Anywhere,
            priority: Priority::Normal,
        }
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("name", &self.name)
            .field("placement", &self.placement)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

const INPROC_SCHEME: &str = "inproc://";

/// Address under which a running pool can be reached, e.g. `inproc://analysis`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolAddress(String);

impl PoolAddress {
    pub fn inproc(name: &str) -> Self {
        Self(format!("{INPROC_SCHEME}{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.strip_prefix(INPROC_SCHEME).unwrap_or(&self.0)
    }
}

impl FromStr for PoolAddress {
    type Err = ExecError;

    /// Accepts `inproc://<name>` or a bare `<name>`.
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let name = match raw.split_once("://") {
            Some(("inproc", name)) => name,
            Some((scheme, _)) => {
                return Err(ExecError::InvalidConfig(format!(
                    "unsupported pool address scheme: {scheme}"
                )))
            }
            None => raw,
        };
        if name.is_empty() {
            return Err(ExecError::InvalidConfig(format!(
                "pool address has no name: {raw:?}"
            )));
        }
        Ok(Self::inproc(name))
    }
}

impl fmt::Display for PoolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection handle to a running worker pool.
pub trait WorkerPool: Send + Sync {
    fn address(&self) -> &PoolAddress;

    /// Identities of the workers currently in the pool
    fn workers(&self) -> Vec<WorkerId>;

    /// Enqueue one unit of work. Returns without waiting for it to run.
    fn submit(&self, submission: Submission) -> Result<TaskHandle>;

    /// Best-effort cancellation; does not wait for running bodies to stop.
    fn cancel(&self, handles: &[TaskHandle]);

    /// Stop accepting work, cancel what is in flight and wait up to
    /// `timeout` for the workers to exit.
    fn shutdown(&self, timeout: Duration) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_allows() {
        let w0 = WorkerId::new("worker-0");
        let w1 = WorkerId::new("worker-1");
        assert!(Placement::Anywhere.allows(&w0));

        let restricted = Placement::Restricted(vec![w1.clone()]);
        assert!(restricted.allows(&w1));
        assert!(!restricted.allows(&w0));
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn pool_address_parse() {
        let addr: PoolAddress = "inproc://analysis".parse().unwrap();
        assert_eq!(addr.as_str(), "inproc://analysis");
        assert_eq!(addr.name(), "analysis");

        let bare: PoolAddress = "analysis".parse().unwrap();
        assert_eq!(bare, addr);
    }

    #[test]
    fn pool_address_rejects_other_schemes() {
        assert!("tcp://127.0.0.1:8786".parse::<PoolAddress>().is_err());
        assert!("inproc://".parse::<PoolAddress>().is_err());
        assert!("".parse::<PoolAddress>().is_err());
    }
}
