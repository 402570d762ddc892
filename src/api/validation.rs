use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};

/// Error body shared by every component of the chain
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub fields: serde_json::Value,
}

impl ErrorResponse {
    pub fn message(error: &str, message: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.to_string(),
            fields: serde_json::json!({"message": message.into()}),
        }
    }
}

fn bad_request(error: &str, fields: serde_json::Map<String, serde_json::Value>) -> actix_web::Error {
    let error_response = ErrorResponse {
        error: error.to_string(),
        fields: serde_json::Value::Object(fields),
    };
    actix_web::error::InternalError::from_response("", HttpResponse::BadRequest().json(error_response))
        .into()
}

/// JsonConfig with standardized error handling for job specifications
///
/// Malformed specifications are rejected here, synchronously, before any job exists.
pub fn json_config(max_payload_size: usize) -> actix_web_validator::JsonConfig {
    actix_web_validator::JsonConfig::default()
        .limit(max_payload_size)
        .error_handler(|err, _req| {
            let mut fields = serde_json::Map::new();

            match err {
                actix_web_validator::Error::Validate(validation_errors) => {
                    for (field, errors) in validation_errors.field_errors() {
                        let messages: Vec<String> = errors
                            .iter()
                            .map(|e| {
                                e.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| format!("Validation error in field: {}", field))
                            })
                            .collect();
                        fields.insert(field.to_string(), serde_json::json!({"errors": messages}));
                    }
                    bad_request("Validation failed", fields)
                }
                actix_web_validator::Error::Deserialize(de_err) => {
                    let err_string = de_err.to_string();

                    let message = if err_string.contains("EOF while parsing") {
                        "Request body is empty. Expected a JSON job specification"
                    } else if err_string.contains("missing field") {
                        "Job specification requires 'model' and 'args'"
                    } else {
                        "Invalid JSON format"
                    };
                    fields.insert("message".to_string(), serde_json::json!(message));
                    bad_request("Request validation failed", fields)
                }
                other => {
                    fields.insert("message".to_string(), serde_json::json!(other.to_string()));
                    bad_request("Request validation failed", fields)
                }
            }
        })
}
