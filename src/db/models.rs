use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::api::job::models::JobStatus;
use crate::db::StoreError;

/// Database representation of a job with all fields
#[derive(Debug, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub process_id: String,
    pub spec: serde_json::Value,
    pub status: String,
    pub result_location: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The authoritative job record, independent of the backing store
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub process_id: String,
    pub spec: serde_json::Value,
    pub status: JobStatus,
    pub result_location: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(process_id: &str, spec: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id: process_id.to_string(),
            spec,
            status: JobStatus::Accepted,
            result_location: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Apply a terminal outcome to a running job
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<(), StoreError> {
        let next = outcome.status();
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match outcome {
            JobOutcome::Successful {
                result,
                result_location,
            } => {
                self.result = Some(result);
                self.result_location = Some(result_location);
            }
            JobOutcome::Failed {
                error,
                result_location,
            } => {
                self.error = Some(error);
                self.result_location = Some(result_location);
            }
        }
        self.status = next;
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(row.id, e))?;

        Ok(JobRecord {
            id: row.id,
            process_id: row.process_id,
            spec: row.spec,
            status,
            result_location: row.result_location,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

/// Terminal outcome of an execution, written back by the worker that owns the job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Successful {
        result: serde_json::Value,
        result_location: String,
    },
    Failed {
        error: serde_json::Value,
        result_location: String,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Successful { .. } => JobStatus::Successful,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Diagnostic document in the shape clients receive for failed jobs
    pub fn failure(code: &str, description: impl Into<String>, result_location: String) -> Self {
        JobOutcome::Failed {
            error: serde_json::json!({
                "code": code,
                "description": description.into(),
            }),
            result_location,
        }
    }
}
