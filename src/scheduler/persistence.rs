//! The narrow persistence contract the scheduler depends on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{JobId, JobRecord, TaskId};

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Reserve the ID for a task about to be created for `job_id`.
    async fn assign_next_task_id(&self, job_id: JobId) -> Result<TaskId>;

    /// Fails with [`Error::JobNotFound`].
    async fn get_job_by_id(&self, job_id: JobId) -> Result<JobRecord>;
}

/// Process-local repository, seeded from job files or tests.
#[derive(Debug)]
pub struct MemoryRepository {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    next_task_id: AtomicI64,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_task_id: AtomicI64::new(1),
        }
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: JobRecord) {
        self.jobs.write().await.insert(job.job_id, job);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn assign_next_task_id(&self, _job_id: JobId) -> Result<TaskId> {
        Ok(TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn get_job_by_id(&self, job_id: JobId) -> Result<JobRecord> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_ids_are_unique_and_increasing() {
        let repo = MemoryRepository::new();
        let a = repo.assign_next_task_id(JobId(1)).await.unwrap();
        let b = repo.assign_next_task_id(JobId(2)).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.get_job_by_id(JobId(99)).await,
            Err(Error::JobNotFound(JobId(99)))
        ));
    }
}
