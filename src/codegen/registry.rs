use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::executor::JobExecutor;

/// Live executors by job ID. At most one executor per job is registered at
/// a time.
#[derive(Default)]
pub struct JobRegistry {
    executors: Mutex<HashMap<i64, Arc<JobExecutor>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor`, returning a guard that removes it on drop.
    /// Returns `None` if the job already has a live executor.
    pub fn register(self: &Arc<Self>, executor: Arc<JobExecutor>) -> Option<Registration> {
        let job_id = executor.job_id();
        let mut map = self.executors.lock().ok()?;
        if map.contains_key(&job_id) {
            return None;
        }
        map.insert(job_id, executor);
        Some(Registration {
            registry: Arc::clone(self),
            job_id,
        })
    }

    pub fn get(&self, job_id: i64) -> Option<Arc<JobExecutor>> {
        self.executors
            .lock()
            .ok()
            .and_then(|map| map.get(&job_id).cloned())
    }

    pub fn remove(&self, job_id: i64) -> Option<Arc<JobExecutor>> {
        self.executors
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&job_id))
    }

    pub fn len(&self) -> usize {
        self.executors.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IDs of every live job, ascending.
    pub fn job_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .executors
            .lock()
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

/// Keeps a job registered for as long as it is alive, including when the
/// job's task panics.
pub struct Registration {
    registry: Arc<JobRegistry>,
    job_id: i64,
}

impl Registration {
    pub fn job_id(&self) -> i64 {
        self.job_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.job_id);
    }
}
