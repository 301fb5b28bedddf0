use agentrix_protocol::{ErrorBody, ErrorCode, ErrorDetail};
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use libagentrix::{AgentrixError, StepFailure};

/// An error rendered as `{"error": {"code", "message", "step"?}}`.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub step: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step: None,
            retry_after_secs: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<AgentrixError> for ApiError {
    fn from(err: AgentrixError) -> Self {
        if let AgentrixError::RateLimited { retry_after_secs } = err {
            let mut api = Self::new(ErrorCode::RateLimited, err.to_string());
            api.retry_after_secs = Some(retry_after_secs);
            return api;
        }
        if matches!(err.code(), ErrorCode::InternalError) {
            tracing::error!(error = %err, "request failed");
        }
        let (code, message) = err.to_error_code();
        Self::new(code, message)
    }
}

impl From<StepFailure> for ApiError {
    fn from(failure: StepFailure) -> Self {
        let mut api = ApiError::from(failure.error);
        api.step = Some(failure.step.as_str().to_string());
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                step: self.step,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
