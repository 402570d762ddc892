use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Pool, Postgres};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::job::models::JobStatus;
use crate::db::StoreError;
use crate::db::models::{JobOutcome, JobRecord, JobRow};

const JOB_COLUMNS: &str = "id, process_id, spec, status, result_location, result, error, \
                           created_at, updated_at, finished_at";

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides exactly once whether an insert commits or is abandoned by its caller
#[derive(Clone, Default)]
pub struct CommitGate(Arc<AtomicU8>);

impl CommitGate {
    /// Claim the right to commit; false once the caller has given up
    pub fn try_commit(&self) -> bool {
        self.0
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up on the insert; false once the commit has started
    pub fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Repository for Job database operations
pub struct JobRepository;

impl JobRepository {
    /// Insert a new job and return the stored record
    pub async fn insert<'e, E>(executor: E, job: &JobRecord) -> Result<JobRecord, StoreError>
    where
        E: PgExecutor<'e>,
    {
        debug!("Creating job: id={}, process={}", job.id, job.process_id);

        let query = format!(
            r#"
            INSERT INTO jobs (id, process_id, spec, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job.id)
            .bind(&job.process_id)
            .bind(&job.spec)
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(executor)
            .await?;

        debug!("Job created with id={}", row.id);
        row.try_into()
    }

    /// Insert a new job unless `window` elapses first
    ///
    /// The row is written inside a transaction on a separate task. When the
    /// window elapses before the commit has started, the transaction is rolled
    /// back and `None` is returned. Once the commit has started the caller
    /// waits for it, so no job exists that the caller was told was not created.
    pub async fn create_within(
        pool: &Pool<Postgres>,
        job: JobRecord,
        window: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let gate = CommitGate::default();
        let task_gate = gate.clone();
        let pool = pool.clone();

        let mut insert = tokio::spawn(Self::insert_unless_abandoned(pool, job, task_gate));

        match tokio::time::timeout(window, &mut insert).await {
            Ok(joined) => joined?,
            Err(_) if gate.abandon() => {
                warn!("Job insert did not finish within {:?}, abandoning it", window);
                Ok(None)
            }
            Err(_) => {
                debug!("Job insert is already committing, waiting for it");
                insert.await?
            }
        }
    }

    async fn insert_unless_abandoned(
        pool: Pool<Postgres>,
        job: JobRecord,
        gate: CommitGate,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut tx = pool.begin().await?;
        let record = Self::insert(&mut *tx, &job).await?;
        if !gate.try_commit() {
            debug!("Admission of job {} abandoned, rolling back", job.id);
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(record))
    }

    pub async fn find_by_id(
        pool: &Pool<Postgres>,
        id: Uuid,
    ) -> Result<Option<JobRecord>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    pub async fn list(
        pool: &Pool<Postgres>,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }

    /// Atomically claim the oldest accepted job
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from claiming the same row.
    pub async fn acquire_next_job(pool: &Pool<Postgres>) -> Result<Option<JobRecord>, StoreError> {
        let query = format!(
            r#"
            UPDATE jobs
            SET status = 'running', updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'accepted'
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .fetch_optional(pool)
            .await?;

        if let Some(row) = &row {
            debug!("Acquired job id={}", row.id);
        }
        row.map(JobRecord::try_from).transpose()
    }

    /// Write a terminal outcome; only a running job can be completed
    pub async fn complete(
        pool: &Pool<Postgres>,
        id: Uuid,
        outcome: JobOutcome,
    ) -> Result<JobRecord, StoreError> {
        let status = outcome.status();
        let (result, error, result_location) = match outcome {
            JobOutcome::Successful {
                result,
                result_location,
            } => (Some(result), None, result_location),
            JobOutcome::Failed {
                error,
                result_location,
            } => (None, Some(error), result_location),
        };

        let query = format!(
            r#"
            UPDATE jobs
            SET status = $2, result = $3, error = $4, result_location = $5,
                updated_at = now(), finished_at = now()
            WHERE id = $1 AND status = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(status.as_str())
            .bind(result)
            .bind(error)
            .bind(result_location)
            .fetch_optional(pool)
            .await?;

        match row {
            Some(row) => {
                debug!("Job {} completed with status={}", id, status);
                row.try_into()
            }
            None => match Self::find_by_id(pool, id).await? {
                Some(current) => Err(StoreError::InvalidTransition {
                    id,
                    from: current.status,
                    to: status,
                }),
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    /// Delete terminal jobs last updated before `cutoff`
    pub async fn expire(pool: &Pool<Postgres>, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('successful', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(pool)
        .await?;

        let rows_affected = result.rows_affected();
        debug!("Expired {} jobs", rows_affected);
        Ok(rows_affected)
    }
}
