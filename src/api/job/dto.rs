use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::JobStatus;
use crate::db::models::JobRecord;

/// Status document returned by submission and `GET /jobs/{job_id}`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusDocument {
    pub job_id: Uuid,
    pub process_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
}

impl From<&JobRecord> for StatusDocument {
    fn from(job: &JobRecord) -> Self {
        StatusDocument {
            job_id: job.id,
            process_id: job.process_id.clone(),
            kind: "process".to_string(),
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            result_location: job.result_location.clone(),
        }
    }
}

/// Result document returned by `GET /jobs/{job_id}/results` for terminal jobs
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResultDocument {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
}

impl From<&JobRecord> for ResultDocument {
    fn from(job: &JobRecord) -> Self {
        ResultDocument {
            job_id: job.id,
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            result_location: job.result_location.clone(),
        }
    }
}

/// Response for `GET /jobs`
#[derive(Serialize, Deserialize, Debug)]
pub struct JobList {
    pub jobs: Vec<StatusDocument>,
    pub count: usize,
}

/// Query parameters for `GET /jobs`
#[derive(Deserialize, Debug)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}
