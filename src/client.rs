//! Polling client for the public job API.
//!
//! A submission is identified solely by the `Location` header of its `201`
//! response; the body is informational and may be empty after the proxies.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, LOCATION};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::api::job::dto::{ResultDocument, StatusDocument};
use crate::api::job::handlers::{PREFER, RESPOND_ASYNC};
use crate::api::job::models::JobStatus;
use crate::api::validation::ErrorResponse;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("submission response has no usable Location header")]
    MissingLocation,

    #[error("job {0} not found")]
    NotFound(String),

    #[error("results of job {job_id} not ready (status {status})")]
    NotReady { job_id: String, status: String },

    #[error("job {job_id} went from {from} back to {to}")]
    Regressed {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} did not finish in time")]
    Deadline(String),

    #[error("unexpected response {status}: {body}")]
    Unexpected { status: StatusCode, body: String },
}

/// Handle returned by a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Absolute status URL from `Location`, without credentials
    pub location: Url,
}

impl SubmittedJob {
    /// Read the job handle from a `201` response's headers
    ///
    /// Relative `Location` values are resolved against `request_url`.
    pub fn from_response(request_url: &Url, headers: &HeaderMap) -> Result<Self, ClientError> {
        let raw = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ClientError::MissingLocation)?;
        let mut location = request_url.join(raw)?;
        location.set_query(None);
        let job_id = job_id_from_location(&location).ok_or(ClientError::MissingLocation)?;
        Ok(Self { job_id, location })
    }
}

/// The last non-empty path segment of a status URL
pub fn job_id_from_location(location: &Url) -> Option<String> {
    location
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

pub struct JobClient {
    base_url: Url,
    key: Option<String>,
    http: reqwest::Client,
}

impl JobClient {
    pub fn new(base_url: Url, key: Option<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            key,
            http,
        })
    }

    fn with_key(&self, mut url: Url) -> Url {
        if let Some(key) = &self.key {
            url.query_pairs_mut().append_pair("key", key);
        }
        url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(base.join(path.trim_start_matches('/'))?)
    }

    /// Handle for a job known only by id, e.g. from an earlier session
    pub fn job(&self, job_id: &str) -> Result<SubmittedJob, ClientError> {
        Ok(SubmittedJob {
            job_id: job_id.to_string(),
            location: self.endpoint(&format!("jobs/{}", job_id))?,
        })
    }

    /// Submit `spec` to `process_id` for asynchronous execution
    pub async fn submit(
        &self,
        process_id: &str,
        spec: &serde_json::Value,
    ) -> Result<SubmittedJob, ClientError> {
        let url = self.endpoint(&format!("processes/{}/execution", process_id))?;
        let response = self
            .http
            .post(self.with_key(url.clone()))
            .header(PREFER, RESPOND_ASYNC)
            .json(spec)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(unexpected(response).await);
        }
        let job = SubmittedJob::from_response(&url, response.headers())?;
        info!("Submitted job {} at {}", job.job_id, job.location);
        Ok(job)
    }

    pub async fn status(&self, job: &SubmittedJob) -> Result<StatusDocument, ClientError> {
        let response = self.http.get(self.with_key(job.location.clone())).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(job.job_id.clone())),
            _ => Err(unexpected(response).await),
        }
    }

    /// Results of a terminal job; a failed job yields its error document
    pub async fn results(&self, job: &SubmittedJob) -> Result<ResultDocument, ClientError> {
        let mut url = job.location.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::MissingLocation)?
            .pop_if_empty()
            .push("results");

        let response = self.http.get(self.with_key(url)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(job.job_id.clone())),
            StatusCode::CONFLICT => {
                let status = response
                    .json::<ErrorResponse>()
                    .await
                    .ok()
                    .and_then(|body| body.fields["status"].as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                Err(ClientError::NotReady {
                    job_id: job.job_id.clone(),
                    status,
                })
            }
            _ => Err(unexpected(response).await),
        }
    }

    /// Poll until the job is terminal, then fetch its results
    ///
    /// Fails if an observed status ever moves backwards.
    pub async fn wait_for_results(
        &self,
        job: &SubmittedJob,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<ResultDocument, ClientError> {
        let started = tokio::time::Instant::now();
        let mut tracker = StatusTracker::default();

        loop {
            let status = self.status(job).await?.status;
            tracker.observe(&job.job_id, status)?;
            if status.is_terminal() {
                return self.results(job).await;
            }
            if deadline.is_some_and(|limit| started.elapsed() >= limit) {
                return Err(ClientError::Deadline(job.job_id.clone()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Checks that successive observations of one job never regress
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<JobStatus>,
}

impl StatusTracker {
    pub fn observe(&mut self, job_id: &str, status: JobStatus) -> Result<(), ClientError> {
        if let Some(last) = self.last {
            if status.rank() < last.rank() {
                return Err(ClientError::Regressed {
                    job_id: job_id.to_string(),
                    from: last,
                    to: status,
                });
            }
            if status != last {
                debug!("Job {} moved from {} to {}", job_id, last, status);
            }
        }
        self.last = Some(status);
        Ok(())
    }
}

async fn unexpected(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::Unexpected { status, body }
}
