use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExecError, Result};

/// Parallelism parameters for a locally provisioned worker pool.
///
/// Deserializable from JSON so callers can pass through an opaque
/// option map such as `{"workers": 2, "threads_per_worker": 1}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of workers in the pool
    #[serde(alias = "workers")]
    pub n_workers: usize,
    /// Execution threads per worker; each runs one task at a time
    pub threads_per_worker: usize,
    /// Numeric thread budget handed to each task body while it runs
    pub task_threads: usize,
    /// Prefix for generated worker identities (`<prefix>-<index>`)
    pub worker_prefix: String,
    /// Name the pool is published under (`inproc://<name>`); random if unset
    pub name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            threads_per_worker: 1,
            task_threads: 1,
            worker_prefix: "worker".to_string(),
            name: None,
        }
    }
}

impl PoolConfig {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers,
            ..Default::default()
        }
    }

    pub fn with_threads_per_worker(mut self, threads: usize) -> Self {
        self.threads_per_worker = threads;
        self
    }

    pub fn with_task_threads(mut self, threads: usize) -> Self {
        self.task_threads = threads;
        self
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse a JSON option map, filling unspecified fields with defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ExecError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_workers == 0 {
            return Err(ExecError::InvalidConfig(
                "pool needs at least one worker".to_string(),
            ));
        }
        if self.threads_per_worker == 0 {
            return Err(ExecError::InvalidConfig(
                "threads_per_worker must be at least 1".to_string(),
            ));
        }
        if self.task_threads == 0 {
            return Err(ExecError::InvalidConfig(
                "task_threads must be at least 1".to_string(),
            ));
        }
        if self.worker_prefix.is_empty() {
            return Err(ExecError::InvalidConfig(
                "worker_prefix must not be empty".to_string(),
            ));
        }
        if matches!(self.name.as_deref(), Some(name) if name.is_empty() || name.contains("://")) {
            return Err(ExecError::InvalidConfig(format!(
                "invalid pool name: {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// How long `connect` waits for a pool to appear at the address
    pub connect_timeout_ms: u64,
    /// Bounded wait for local pool teardown during `close`
    pub teardown_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            teardown_timeout_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_teardown_timeout_ms(mut self, ms: u64) -> Self {
        self.teardown_timeout_ms = ms;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}
