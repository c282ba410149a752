use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;

/// Failures of explicit run/stop actions. These surface to the caller.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid or inaccessible path: {path}")]
    InvalidPath { path: String },
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no running process for script {script_id}")]
    NotFound { script_id: String },
    #[error("failed to signal pid {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// Correlation found nothing. A normal negative answer, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelateError {
    #[error("no active process found for `{command}` in {path}")]
    NoMatch { path: String, command: String },
}

/// OS query failure. Never leaves the probing functions.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProbeError {
    #[error("`{program}` timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u128 },
    #[error("failed to run `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with {status}: {stderr}")]
    Status {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unparseable output from `{program}`: {detail}")]
    Parse { program: String, detail: String },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// HTTP-facing error: a status code plus a JSON payload.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
            },
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.payload.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        let message = err.to_string();
        match err {
            RunnerError::InvalidPath { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_path", message)
                    .with_hint("Check that the directory exists and is readable.")
            }
            RunnerError::SpawnFailed { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "spawn_failed", message)
                    .with_hint("Ensure the command exists and is executable.")
            }
            RunnerError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            RunnerError::SignalFailed { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "signal_failed", message)
            }
        }
    }
}

impl From<CorrelateError> for ApiError {
    fn from(err: CorrelateError) -> Self {
        Self::new(StatusCode::NOT_FOUND, "no_match", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let err = ApiError::bad_request(long);
        assert!(err.payload.message.len() <= MAX_MESSAGE_BYTES);
        assert!(err.payload.message.ends_with("…(truncated)"));
    }

    #[test]
    fn runner_errors_map_to_status_codes() {
        let e: ApiError = RunnerError::InvalidPath {
            path: "/nope".to_string(),
        }
        .into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.payload.code, "invalid_path");
        assert!(e.payload.hint.is_some());

        let e: ApiError = RunnerError::NotFound {
            script_id: "a".to_string(),
        }
        .into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.payload.code, "not_found");

        let e: ApiError = CorrelateError::NoMatch {
            path: "/tmp".to_string(),
            command: "dev".to_string(),
        }
        .into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.payload.code, "no_match");
    }
}
