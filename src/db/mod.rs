pub mod connection;
pub mod job_repository;
pub mod memory;
pub mod migrations;
pub mod models;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::api::job::models::JobStatus;
use job_repository::JobRepository;
use memory::MemoryJobStore;
use models::{JobOutcome, JobRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt job record {0}: {1}")]
    Corrupt(Uuid, String),

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The job store owned by the execution service
///
/// Either a best-effort in-memory map or a PostgreSQL table. Cloning is cheap
/// and every clone sees the same records.
#[derive(Clone)]
pub enum JobStore {
    Memory(MemoryJobStore),
    Postgres(Pool<Postgres>),
}

impl JobStore {
    pub fn memory() -> Self {
        JobStore::Memory(MemoryJobStore::default())
    }

    /// Connect to PostgreSQL and apply pending migrations
    pub async fn postgres(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = connection::get_connection(database_url, max_connections).await?;
        info!("Database connection pool established");
        migrations::run_migrations(&pool).await?;
        Ok(JobStore::Postgres(pool))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            JobStore::Memory(_) => "memory",
            JobStore::Postgres(_) => "postgres",
        }
    }

    /// Insert a new job in `accepted` state
    #[cfg(test)]
    pub async fn create(
        &self,
        process_id: &str,
        spec: serde_json::Value,
    ) -> Result<JobRecord, StoreError> {
        let job = JobRecord::new(process_id, spec);
        match self {
            JobStore::Memory(store) => store.insert(job).await,
            JobStore::Postgres(pool) => JobRepository::insert(pool, &job).await,
        }
    }

    /// Insert a new job in `accepted` state if that completes within `window`
    ///
    /// `None` means the window elapsed and no job exists, now or later.
    pub async fn create_within(
        &self,
        process_id: &str,
        spec: serde_json::Value,
        window: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let job = JobRecord::new(process_id, spec);
        match self {
            // The insert takes the lock and finishes without yielding again,
            // so a cancelled insert never lands
            JobStore::Memory(store) => match tokio::time::timeout(window, store.insert(job)).await {
                Ok(inserted) => inserted.map(Some),
                Err(_) => Ok(None),
            },
            JobStore::Postgres(pool) => JobRepository::create_within(pool, job, window).await,
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        match self {
            JobStore::Memory(store) => Ok(store.get(id).await),
            JobStore::Postgres(pool) => JobRepository::find_by_id(pool, id).await,
        }
    }

    /// Newest jobs first, optionally filtered by status
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        match self {
            JobStore::Memory(store) => Ok(store.list(status, limit).await),
            JobStore::Postgres(pool) => JobRepository::list(pool, status, limit).await,
        }
    }

    /// Take ownership of the oldest accepted job by moving it to `running`
    ///
    /// At most one caller receives a given job.
    pub async fn acquire_next(&self) -> Result<Option<JobRecord>, StoreError> {
        match self {
            JobStore::Memory(store) => Ok(store.acquire_next().await),
            JobStore::Postgres(pool) => JobRepository::acquire_next_job(pool).await,
        }
    }

    /// Move a running job to its terminal state
    pub async fn complete(&self, id: Uuid, outcome: JobOutcome) -> Result<JobRecord, StoreError> {
        match self {
            JobStore::Memory(store) => store.complete(id, outcome).await,
            JobStore::Postgres(pool) => JobRepository::complete(pool, id, outcome).await,
        }
    }

    /// Remove terminal jobs last updated before `cutoff`
    pub async fn expire(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        match self {
            JobStore::Memory(store) => Ok(store.expire(cutoff).await),
            JobStore::Postgres(pool) => JobRepository::expire(pool, cutoff).await,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            JobStore::Memory(_) => Ok(()),
            JobStore::Postgres(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await?;
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        if let JobStore::Postgres(pool) = self {
            pool.close().await;
        }
    }
}
