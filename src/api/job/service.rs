use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use super::models::{JobSpec, JobStatus};
use crate::api::validation::ErrorResponse;
use crate::db::models::JobRecord;
use crate::db::{JobStore, StoreError};
use crate::processes::ProcessRegistry;

const MAX_LIST_LIMIT: i64 = 1000;

/// Service-level errors
#[derive(Debug)]
pub enum ServiceError {
    /// Job store operation failed
    Store(StoreError),

    /// Job specification rejected
    Validation(String),

    /// Unknown process id
    ProcessNotFound(String),

    /// Unknown or expired job id
    JobNotFound(String),

    /// Job exists but has not reached a terminal state
    NotReady { job_id: Uuid, status: JobStatus },

    /// The job could not be recorded within the acknowledgment window
    AdmissionTimeout(Duration),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Store(e) => write!(f, "Store error: {}", e),
            ServiceError::Validation(msg) => write!(f, "Validation error: {}", msg),
            ServiceError::ProcessNotFound(id) => write!(f, "Process not found: {}", id),
            ServiceError::JobNotFound(id) => write!(f, "Job not found: {}", id),
            ServiceError::NotReady { job_id, status } => {
                write!(f, "Result of job {} not ready (status {})", job_id, status)
            }
            ServiceError::AdmissionTimeout(window) => {
                write!(f, "Job not accepted within {:?}", window)
            }
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Store(e)
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::ProcessNotFound(_) | ServiceError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::NotReady { .. } => StatusCode::CONFLICT,
            ServiceError::AdmissionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            ServiceError::Store(e) => {
                error!("Store error: {}", e);
                ErrorResponse::message("Failed to process request", "Job store error occurred")
            }
            ServiceError::Validation(msg) => {
                warn!("Validation error: {}", msg);
                ErrorResponse::message("Validation failed", msg.clone())
            }
            ServiceError::ProcessNotFound(id) => {
                warn!("Process not found: {}", id);
                ErrorResponse::message("Not found", format!("Process {} not found", id))
            }
            ServiceError::JobNotFound(id) => {
                warn!("Job not found: {}", id);
                ErrorResponse::message("Not found", format!("Job with id {} not found", id))
            }
            ServiceError::NotReady { job_id, status } => ErrorResponse {
                error: "Result not ready".to_string(),
                fields: serde_json::json!({"job_id": job_id, "status": status}),
            },
            ServiceError::AdmissionTimeout(window) => {
                error!("Submission not recorded within {:?}", window);
                ErrorResponse::message(
                    "Service unavailable",
                    "Job could not be accepted in time, no job was created",
                )
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

/// Job service containing business logic
pub struct JobService {
    store: JobStore,
    processes: Arc<ProcessRegistry>,
    public_base_url: Url,
    ack_window: Duration,
    allowed_models: Option<HashSet<String>>,
    wake: Arc<Notify>,
}

impl JobService {
    /// Create a new JobService instance
    pub fn new(
        store: JobStore,
        processes: Arc<ProcessRegistry>,
        public_base_url: Url,
        ack_window: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            processes,
            public_base_url,
            ack_window,
            allowed_models: None,
            wake,
        }
    }

    pub fn with_allowed_models(mut self, allowed_models: Option<HashSet<String>>) -> Self {
        self.allowed_models = allowed_models;
        self
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Public URL of a job's status document
    pub fn job_url(&self, id: Uuid) -> String {
        format!(
            "{}/jobs/{}",
            self.public_base_url.as_str().trim_end_matches('/'),
            id
        )
    }

    /// Accept a job for asynchronous execution
    ///
    /// # Business Logic
    /// - Rejects unknown processes and disallowed models synchronously
    /// - Records the job as `accepted` within the acknowledgment window
    /// - Wakes the worker pool; never waits for execution
    pub async fn submit(&self, process_id: &str, spec: &JobSpec) -> Result<JobRecord, ServiceError> {
        if self.processes.get(process_id).is_none() {
            return Err(ServiceError::ProcessNotFound(process_id.to_string()));
        }

        if let Some(allowed) = &self.allowed_models {
            if !allowed.contains(&spec.model) {
                return Err(ServiceError::Validation(format!(
                    "Model {} is not available",
                    spec.model
                )));
            }
        }

        let spec_value = serde_json::to_value(spec)
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        info!("Service: Submitting job for process={}, model={}", process_id, spec.model);

        let job = self
            .store
            .create_within(process_id, spec_value, self.ack_window)
            .await?
            .ok_or(ServiceError::AdmissionTimeout(self.ack_window))?;

        self.wake.notify_one();
        info!("Service: Job accepted with id={}", job.id);
        Ok(job)
    }

    /// Current snapshot of a job
    pub async fn status(&self, job_id: &str) -> Result<JobRecord, ServiceError> {
        let id = parse_job_id(job_id)?;
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    /// Terminal job record, or `NotReady` while it is still accepted or running
    pub async fn result(&self, job_id: &str) -> Result<JobRecord, ServiceError> {
        let job = self.status(job_id).await?;
        if !job.status.is_terminal() {
            return Err(ServiceError::NotReady {
                job_id: job.id,
                status: job.status,
            });
        }
        Ok(job)
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<JobRecord>, ServiceError> {
        let limit = limit.unwrap_or(100).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list(status, limit).await?)
    }
}

/// Ids that are not UUIDs cannot name a job, so they read as not found
fn parse_job_id(job_id: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(job_id).map_err(|_| ServiceError::JobNotFound(job_id.to_string()))
}
