use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::models::{JobOutcome, JobRecord};
use crate::processes::{OutputKind, ProcessDefinition};

const STDERR_TAIL_BYTES: usize = 4096;

/// Runs a job through the external processing engine
///
/// Each job gets its own workspace directory holding `spec.json`,
/// `stdout.log` and `stderr.log`; the configured command runs inside it.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    workspace_root: PathBuf,
    results_base_url: Option<Url>,
    job_timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(
        workspace_root: PathBuf,
        results_base_url: Option<Url>,
        job_timeout: Option<Duration>,
    ) -> Self {
        Self {
            workspace_root,
            results_base_url,
            job_timeout,
        }
    }

    pub fn workspace(&self, job_id: Uuid) -> PathBuf {
        self.workspace_root.join(job_id.to_string())
    }

    /// Where a finished job's outputs can be found
    pub fn result_location(&self, job_id: Uuid) -> String {
        match &self.results_base_url {
            Some(base) => format!("{}/{}", base.as_str().trim_end_matches('/'), job_id),
            None => {
                let workspace = self.workspace(job_id);
                let absolute = std::path::absolute(&workspace).unwrap_or(workspace);
                Url::from_directory_path(&absolute)
                    .map(|url| url.to_string())
                    .unwrap_or_else(|_| absolute.display().to_string())
            }
        }
    }

    /// Execute `job` and translate whatever happens into a terminal outcome
    pub async fn run(&self, job: &JobRecord, process: &ProcessDefinition) -> JobOutcome {
        let location = self.result_location(job.id);
        let workspace = self.workspace(job.id);

        let spec_path = match prepare_workspace(&workspace, &job.spec).await {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to prepare workspace for job {}: {:?}", job.id, e);
                return JobOutcome::failure(
                    "WorkspaceError",
                    format!("Could not prepare workspace: {}", e),
                    location,
                );
            }
        };

        let model = job.spec["model"].as_str().unwrap_or_default();
        let args = render_command(&process.command, model, &spec_path, &workspace);
        info!("Running job {} with command: {:?}", job.id, args);

        let exit_status = match self.spawn_and_wait(&args, &workspace).await {
            Ok(status) => status,
            Err(RunError::Timeout(after)) => {
                warn!("Job {} exceeded its time limit of {:?}", job.id, after);
                return JobOutcome::failure(
                    "Timeout",
                    format!("Execution exceeded {} seconds", after.as_secs()),
                    location,
                );
            }
            Err(RunError::Io(e)) => {
                error!("Failed to start job {}: {:?}", job.id, e);
                return JobOutcome::failure(
                    "SpawnFailed",
                    format!("Could not start the processing engine: {}", e),
                    location,
                );
            }
        };

        if !exit_status.success() {
            let code = exit_status.code();
            warn!("Job {} finished with exit code {:?}", job.id, code);
            return JobOutcome::Failed {
                error: json!({
                    "code": "ExecutionFailed",
                    "description": format!("Processing engine exited with code {:?}", code),
                    "exit_code": code,
                    "stderr": read_tail(&workspace.join("stderr.log")).await,
                }),
                result_location: location,
            };
        }

        match process.output {
            OutputKind::Workspace => JobOutcome::Successful {
                result: json!({
                    "model": model,
                    "workspace": location,
                }),
                result_location: location,
            },
            OutputKind::ValidationReport => validation_report(&workspace, location).await,
        }
    }

    async fn spawn_and_wait(
        &self,
        args: &[String],
        workspace: &Path,
    ) -> Result<std::process::ExitStatus, RunError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| RunError::Io(std::io::Error::other("empty command")))?;

        let stdout = log_file(&workspace.join("stdout.log")).await.map_err(RunError::Io)?;
        let stderr = log_file(&workspace.join("stderr.log")).await.map_err(RunError::Io)?;

        let mut child = Command::new(program)
            .args(rest)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Io)?;

        match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map_err(RunError::Io),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill timed out process: {:?}", e);
                    }
                    Err(RunError::Timeout(limit))
                }
            },
            None => child.wait().await.map_err(RunError::Io),
        }
    }
}

enum RunError {
    Io(std::io::Error),
    Timeout(Duration),
}

async fn log_file(path: &Path) -> std::io::Result<std::fs::File> {
    Ok(tokio::fs::File::create(path).await?.into_std().await)
}

async fn prepare_workspace(workspace: &Path, spec: &serde_json::Value) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(workspace).await?;
    let spec_path = workspace.join("spec.json");
    let contents = serde_json::to_vec_pretty(spec).map_err(std::io::Error::other)?;
    tokio::fs::write(&spec_path, contents).await?;
    debug!("Wrote job specification to {}", spec_path.display());
    Ok(spec_path)
}

/// Substitute `{model}`, `{spec}` and `{workspace}` in each template argument
pub fn render_command(template: &[String], model: &str, spec: &Path, workspace: &Path) -> Vec<String> {
    let spec = spec.display().to_string();
    let workspace = workspace.display().to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{model}", model)
                .replace("{spec}", &spec)
                .replace("{workspace}", &workspace)
        })
        .collect()
}

async fn read_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
    }
}

/// The validate process prints `{"validation_results": [[input_ids, message], ...]}`
async fn validation_report(workspace: &Path, location: String) -> JobOutcome {
    let stdout = match tokio::fs::read(workspace.join("stdout.log")).await {
        Ok(stdout) => stdout,
        Err(e) => {
            return JobOutcome::failure(
                "InvalidOutput",
                format!("Could not read validation output: {}", e),
                location,
            );
        }
    };

    match parse_validation_output(&stdout) {
        Ok(results) => JobOutcome::Successful {
            result: json!({ "validation_results": results }),
            result_location: location,
        },
        Err(e) => JobOutcome::failure("InvalidOutput", e, location),
    }
}

pub fn parse_validation_output(stdout: &[u8]) -> Result<Vec<serde_json::Value>, String> {
    let parsed: serde_json::Value = serde_json::from_slice(stdout)
        .map_err(|e| format!("Validation output is not JSON: {}", e))?;

    let entries = parsed["validation_results"]
        .as_array()
        .ok_or_else(|| "Validation output has no 'validation_results' list".to_string())?;

    entries
        .iter()
        .map(|entry| match entry.as_array().map(Vec::as_slice) {
            Some([input_ids, error_message]) => Ok(json!({
                "input_ids": input_ids,
                "error_message": error_message,
            })),
            _ => Err(format!("Unexpected validation entry: {}", entry)),
        })
        .collect()
}
