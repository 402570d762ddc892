use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Job status enum representing the state of a job
///
/// Transitions only move forward: `accepted -> running -> {successful | failed}`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Running,
    Successful,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Successful | JobStatus::Failed)
    }

    /// Position in the partial order accepted < running < terminal
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Accepted => 0,
            JobStatus::Running => 1,
            JobStatus::Successful | JobStatus::Failed => 2,
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Accepted, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Successful)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Job specification submitted to a process
///
/// `model` names the model the engine should run and `args` carries the
/// model arguments verbatim.
#[derive(Deserialize, Serialize, Debug, Clone, Validate)]
pub struct JobSpec {
    #[validate(
        length(min = 1, max = 64, message = "Model must be between 1 and 64 characters"),
        custom(function = "validate_model_id")
    )]
    pub model: String,

    #[validate(custom(function = "validate_args"))]
    pub args: serde_json::Value,
}

fn validate_model_id(model: &str) -> Result<(), ValidationError> {
    if model
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        let mut error = ValidationError::new("model_id");
        error.message = Some(Cow::from(
            "Model may only contain letters, digits, '_' and '-'",
        ));
        Err(error)
    }
}

fn validate_args(args: &serde_json::Value) -> Result<(), ValidationError> {
    if args.is_object() {
        Ok(())
    } else {
        let mut error = ValidationError::new("args_object");
        error.message = Some(Cow::from("Args must be a JSON object"));
        Err(error)
    }
}
