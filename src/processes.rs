use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

/// Public metadata describing a process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessDescription {
    pub id: String,
    pub title: String,
    pub description: String,
    pub version: String,
    #[serde(rename = "jobControlOptions")]
    pub job_control_options: Vec<String>,
    pub keywords: Vec<String>,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
}

/// How a finished command's outputs become the job result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// The result points at the workspace the command wrote into
    Workspace,
    /// The command prints a JSON validation report on stdout
    ValidationReport,
}

#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub description: ProcessDescription,
    /// Command template; `{model}`, `{spec}` and `{workspace}` are substituted per job
    pub command: Vec<String>,
    pub output: OutputKind,
}

/// The processes this execution service offers
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: BTreeMap<String, ProcessDefinition>,
}

impl ProcessRegistry {
    /// Registry with the `execute` and `validate` processes
    pub fn new(execute_command: Vec<String>, validate_command: Vec<String>) -> Self {
        let mut registry = Self::default();
        registry.register(ProcessDefinition {
            description: describe(
                "execute",
                "Model Execute",
                "Executes a geoprocessing model and publishes its workspace.",
                json!({
                    "workspace": {
                        "title": "Workspace",
                        "description": "Location of the workspace containing all model results",
                        "schema": {"type": "string"}
                    }
                }),
            ),
            command: execute_command,
            output: OutputKind::Workspace,
        });
        registry.register(ProcessDefinition {
            description: describe(
                "validate",
                "Model Validate",
                "Validates the arguments of a geoprocessing model.",
                json!({
                    "validation_results": {
                        "title": "Validation results",
                        "description": "Problems found in the arguments; each item lists the input ids involved and an error message",
                        "schema": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "input_ids": {"type": "array", "items": {"type": "string"}},
                                    "error_message": {"type": "string"}
                                }
                            }
                        }
                    }
                }),
            ),
            command: validate_command,
            output: OutputKind::ValidationReport,
        });
        registry
    }

    pub fn register(&mut self, process: ProcessDefinition) {
        self.processes
            .insert(process.description.id.clone(), process);
    }

    pub fn get(&self, id: &str) -> Option<&ProcessDefinition> {
        self.processes.get(id)
    }

    pub fn descriptions(&self) -> Vec<&ProcessDescription> {
        self.processes.values().map(|p| &p.description).collect()
    }
}

fn describe(id: &str, title: &str, description: &str, outputs: serde_json::Value) -> ProcessDescription {
    ProcessDescription {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        version: "0.1.0".to_string(),
        job_control_options: vec!["async-execute".to_string()],
        keywords: vec!["geoprocessing".to_string()],
        inputs: json!({
            "model": {
                "title": "Model",
                "description": "Identifier of the model to run",
                "schema": {"type": "string"},
                "minOccurs": 1,
                "maxOccurs": 1
            },
            "args": {
                "title": "Arguments",
                "description": "Model arguments",
                "schema": {"type": "object"},
                "minOccurs": 1,
                "maxOccurs": 1
            }
        }),
        outputs,
    }
}

/// Split a command template into program and arguments
pub fn parse_command(template: &str) -> Result<Vec<String>, String> {
    let parts: Vec<String> = template.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err("command template must not be empty".to_string());
    }
    Ok(parts)
}
