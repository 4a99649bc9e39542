use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use homehub_agent::LifecycleError;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;
const MAX_HINT_BYTES: usize = 2 * 1024;
const MAX_DETAILS_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let mut end = max_bytes.saturating_sub(suffix.len()).max(1).min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// An HTTP error response carrying an [`ErrorPayload`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
                details: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.payload.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.payload.details = Some(truncate_utf8(&details.into(), MAX_DETAILS_BYTES));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn payload(&self) -> &ErrorPayload {
        &self.payload
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Launch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LifecycleError::PortConflict { .. } => StatusCode::CONFLICT,
            LifecycleError::HealthCheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LifecycleError::LogRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut out = ApiError::new(status, err.code(), err.to_string());
        if let Some(hint) = err.hint() {
            out = out.with_hint(hint);
        }
        if let Some(details) = err.details() {
            out = out.with_details(details);
        }
        out
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.payload.code, message = %self.payload.message, "request failed");
        }
        (self.status, Json(self.payload)).into_response()
    }
}
