use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ExecError, Result};
use crate::pool::TaskHandle;
use crate::scheduler::JobId;

/// Running jobs and their outstanding task handles.
///
/// Safe for concurrent use across different jobs; a second registration of
/// the same job while it is tracked is rejected.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: DashMap<JobId, Vec<TaskHandle>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn register(&self, job_id: JobId, handles: Vec<TaskHandle>) -> Result<()> {
        self.reserve(job_id)?;
        self.attach(job_id, handles);
        Ok(())
    }

    /// Claim `job_id` with no handles yet, before its tasks are dispatched.
    pub fn reserve(&self, job_id: JobId) -> Result<()> {
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => Err(ExecError::DuplicateJob(job_id)),
            Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                Ok(())
            }
        }
    }

    /// Fill in the handles of a reserved job.
    ///
    /// Returns false if the reservation is gone, e.g. drained by a close
    /// while the job was being dispatched.
    pub fn attach(&self, job_id: JobId, handles: Vec<TaskHandle>) -> bool {
        match self.jobs.get_mut(&job_id) {
            Some(mut entry) => {
                tracing::debug!(job_id = %job_id, tasks = handles.len(), "Job registered");
                *entry = handles;
                true
            }
            None => false,
        }
    }

    /// Handles of a tracked job, or `None` if the job is not running.
    pub fn lookup(&self, job_id: JobId) -> Option<Vec<TaskHandle>> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    /// Drop the job's entry. Returns false if it was not tracked.
    pub fn forget(&self, job_id: JobId) -> bool {
        let removed = self.jobs.remove(&job_id).is_some();
        if removed {
            tracing::debug!(job_id = %job_id, "Job forgotten");
        }
        removed
    }

    /// Remove every entry and return all their handles.
    pub fn drain(&self) -> Vec<TaskHandle> {
        let ids: Vec<JobId> = self.running_jobs();
        ids.into_iter()
            .filter_map(|id| self.jobs.remove(&id))
            .flat_map(|(_, handles)| handles)
            .collect()
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerId;

    fn handles(n: usize) -> Vec<TaskHandle> {
        (0..n)
            .map(|i| TaskHandle::new(format!("t{i}"), WorkerId::new("worker-0")))
            .collect()
    }

    #[test]
    fn register_and_lookup() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        let hs = handles(3);

        tracker.register(id, hs.clone()).unwrap();
        assert!(tracker.is_tracked(id));
        assert_eq!(tracker.lookup(id).unwrap(), hs);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.running_jobs(), vec![id]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.register(id, handles(1)).unwrap();

        let err = tracker.register(id, handles(1)).unwrap_err();
        assert!(matches!(err, ExecError::DuplicateJob(dup) if dup == id));
        assert_eq!(tracker.lookup(id).unwrap().len(), 1);
    }

    #[test]
    fn reservation_blocks_duplicates_before_handles_exist() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.reserve(id).unwrap();

        assert!(matches!(tracker.reserve(id), Err(ExecError::DuplicateJob(_))));
        assert!(matches!(tracker.register(id, handles(1)), Err(ExecError::DuplicateJob(_))));
        assert_eq!(tracker.lookup(id).unwrap().len(), 0);

        assert!(tracker.attach(id, handles(2)));
        assert_eq!(tracker.lookup(id).unwrap().len(), 2);
    }

    #[test]
    fn attach_after_drain_reports_lost_reservation() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.reserve(id).unwrap();
        tracker.drain();

        assert!(!tracker.attach(id, handles(1)));
        assert!(!tracker.is_tracked(id));
    }

    #[test]
    fn unknown_job_is_not_tracked() {
        let tracker = JobTracker::new();
        assert!(tracker.lookup(JobId::new()).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn forget_is_idempotent() {
        let tracker = JobTracker::new();
        let id = JobId::new();
        tracker.register(id, handles(2)).unwrap();

        assert!(tracker.forget(id));
        assert!(!tracker.forget(id));
        assert!(tracker.lookup(id).is_none());

        tracker.register(id, handles(1)).unwrap();
        assert!(tracker.is_tracked(id));
    }

    #[test]
    fn drain_returns_every_handle() {
        let tracker = JobTracker::new();
        tracker.register(JobId::new(), handles(2)).unwrap();
        tracker.register(JobId::new(), handles(3)).unwrap();

        assert_eq!(tracker.drain().len(), 5);
        assert!(tracker.is_empty());
    }
}
