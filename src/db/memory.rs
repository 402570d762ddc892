use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::job::models::JobStatus;
use crate::db::StoreError;
use crate::db::models::{JobOutcome, JobRecord};

/// Best-effort in-memory job store; records are lost on restart
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, JobRecord>,
    /// Accepted job ids in submission order
    queue: VecDeque<Uuid>,
}

impl MemoryJobStore {
    pub async fn insert(&self, mut job: JobRecord) -> Result<JobRecord, StoreError> {
        let mut state = self.inner.lock().await;
        while state.jobs.contains_key(&job.id) {
            job.id = Uuid::new_v4();
        }
        state.queue.push_back(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Block every store operation until the guard is dropped
    #[cfg(test)]
    pub async fn stall(&self) -> tokio::sync::OwnedMutexGuard<impl Sized> {
        self.inner.clone().lock_owned().await
    }

    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.inner.lock().await.jobs.get(&id).cloned()
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> Vec<JobRecord> {
        let state = self.inner.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        jobs
    }

    pub async fn acquire_next(&self) -> Option<JobRecord> {
        let mut state = self.inner.lock().await;
        while let Some(id) = state.queue.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Accepted {
                    job.status = JobStatus::Running;
                    job.updated_at = Utc::now();
                    return Some(job.clone());
                }
            }
        }
        None
    }

    pub async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<JobRecord, StoreError> {
        let mut state = self.inner.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.finish(outcome)?;
        Ok(job.clone())
    }

    pub async fn expire(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut state = self.inner.lock().await;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        (before - state.jobs.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStore;
    use chrono::Duration;
    use serde_json::json;

    fn success() -> JobOutcome {
        JobOutcome::Successful {
            result: json!({"workspace": "ok"}),
            result_location: "https://results.example/1".to_string(),
        }
    }

    #[tokio::test]
    async fn jobs_are_acquired_once_in_submission_order() {
        let store = JobStore::memory();
        let first = store.create("execute", json!({"model": "a"})).await.unwrap();
        let second = store.create("execute", json!({"model": "b"})).await.unwrap();
        assert_eq!(first.status, JobStatus::Accepted);
        assert!(first.result_location.is_none());

        let claimed = store.acquire_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);

        let claimed = store.acquire_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(store.acquire_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_requires_a_running_job() {
        let store = JobStore::memory();
        let job = store.create("execute", json!({})).await.unwrap();

        let err = store.complete(job.id, success()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.acquire_next().await.unwrap();
        let done = store.complete(job.id, success()).await.unwrap();
        assert_eq!(done.status, JobStatus::Successful);
        assert!(done.result_location.is_some());
        assert!(done.finished_at.is_some());

        let failed = JobOutcome::failure("X", "late", "loc".to_string());
        let err = store.complete(job.id, failed).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Successful
        );
    }

    #[tokio::test]
    async fn completing_an_unknown_job_is_not_found() {
        let store = JobStore::memory();
        let err = store.complete(Uuid::new_v4(), success()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn expiry_only_removes_old_terminal_jobs() {
        let store = JobStore::memory();
        let done = store.create("execute", json!({})).await.unwrap();
        let pending = store.create("execute", json!({})).await.unwrap();
        store.acquire_next().await.unwrap();
        store.complete(done.id, success()).await.unwrap();

        assert_eq!(store.expire(Utc::now() - Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(store.expire(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);

        assert!(store.get(done.id).await.unwrap().is_none());
        assert!(store.get(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn listing_filters_by_status_newest_first() {
        let store = JobStore::memory();
        let older = store.create("execute", json!({})).await.unwrap();
        let newer = store.create("validate", json!({})).await.unwrap();
        store.acquire_next().await.unwrap();

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].created_at >= all[1].created_at);

        let running = store.list(Some(JobStatus::Running), 10).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, older.id);

        let accepted = store.list(Some(JobStatus::Accepted), 10).await.unwrap();
        assert_eq!(accepted[0].id, newer.id);

        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);
    }
}
