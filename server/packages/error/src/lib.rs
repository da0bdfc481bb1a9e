use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    JobNotFound,
    Timeout,
    SpawnFailed,
    ProcessFailed,
    OutputTooLarge,
    AdmissionRejected,
    RateLimited,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:scribe:error:invalid_request",
            Self::JobNotFound => "urn:scribe:error:job_not_found",
            Self::Timeout => "urn:scribe:error:timeout",
            Self::SpawnFailed => "urn:scribe:error:spawn_failed",
            Self::ProcessFailed => "urn:scribe:error:process_failed",
            Self::OutputTooLarge => "urn:scribe:error:output_too_large",
            Self::AdmissionRejected => "urn:scribe:error:admission_rejected",
            Self::RateLimited => "urn:scribe:error:rate_limited",
            Self::StreamError => "urn:scribe:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::JobNotFound => "Job Not Found",
            Self::Timeout => "Timeout",
            Self::SpawnFailed => "Spawn Failed",
            Self::ProcessFailed => "Process Failed",
            Self::OutputTooLarge => "Output Too Large",
            Self::AdmissionRejected => "Admission Rejected",
            Self::RateLimited => "Rate Limited",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::JobNotFound => 404,
            Self::Timeout => 504,
            Self::SpawnFailed => 500,
            Self::ProcessFailed => 502,
            Self::OutputTooLarge => 502,
            Self::AdmissionRejected => 503,
            Self::RateLimited => 429,
            Self::StreamError => 502,
        }
    }
}

/// RFC 7807 problem document returned by every error path of the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScribeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },
    #[error("generation timed out")]
    Timeout { message: Option<String> },
    #[error("failed to spawn generation tool: {message}")]
    SpawnFailed { message: String },
    #[error("generation tool failed")]
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: Option<String>,
    },
    #[error("generation output exceeded {limit_bytes} bytes")]
    OutputTooLarge { limit_bytes: usize },
    #[error("connection admission rejected: {reason}")]
    AdmissionRejected { reason: String },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl ScribeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::JobNotFound { .. } => ErrorType::JobNotFound,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::ProcessFailed { .. } => ErrorType::ProcessFailed,
            Self::OutputTooLarge { .. } => ErrorType::OutputTooLarge,
            Self::AdmissionRejected { .. } => ErrorType::AdmissionRejected,
            Self::RateLimited { .. } => ErrorType::RateLimited,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// One-line user-facing summary, suitable for a terminal job update.
    /// Unlike `Display`, this folds in the detail a client cares about
    /// (exit code, byte limit) without exposing raw stderr.
    pub fn summary(&self) -> String {
        match self {
            Self::Timeout { message } => message
                .clone()
                .unwrap_or_else(|| "generation timed out".to_string()),
            Self::ProcessFailed {
                exit_code: Some(code),
                ..
            } => format!("generation tool failed with exit code {code}"),
            Self::ProcessFailed {
                exit_code: None, ..
            } => "generation tool was terminated by a signal".to_string(),
            Self::OutputTooLarge { limit_bytes } => {
                format!("generation output exceeded the {limit_bytes} byte limit")
            }
            Self::SpawnFailed { .. } => "generation tool could not be started".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::JobNotFound { job_id } => {
                extensions.insert("jobId".to_string(), Value::String(job_id.clone()));
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::ProcessFailed { exit_code, stderr } => {
                if let Some(code) = exit_code {
                    extensions.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    extensions.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            Self::OutputTooLarge { limit_bytes } => {
                extensions.insert(
                    "limitBytes".to_string(),
                    Value::Number(serde_json::Number::from(*limit_bytes as u64)),
                );
            }
            Self::AdmissionRejected { reason } => {
                extensions.insert("reason".to_string(), Value::String(reason.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<ScribeError> for ProblemDetails {
    fn from(value: ScribeError) -> Self {
        value.to_problem_details()
    }
}

impl From<&ScribeError> for ProblemDetails {
    fn from(value: &ScribeError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_urn_and_status() {
        let err = ScribeError::JobNotFound {
            job_id: "job-7".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.type_, "urn:scribe:error:job_not_found");
        assert_eq!(problem.status, 404);
        assert_eq!(
            problem.extensions.get("jobId"),
            Some(&Value::String("job-7".to_string()))
        );
    }

    #[test]
    fn process_failure_exposes_exit_code() {
        let err = ScribeError::ProcessFailed {
            exit_code: Some(3),
            stderr: Some("model unavailable".to_string()),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(
            problem.extensions.get("exitCode"),
            Some(&Value::Number(serde_json::Number::from(3)))
        );
    }
}
