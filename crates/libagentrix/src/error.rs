use agentrix_protocol::{ErrorCode, SessionId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentrixError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AgentrixError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentrixError::BadRequest(_) => ErrorCode::BadRequest,
            AgentrixError::Unauthorized(_) => ErrorCode::Unauthorized,
            AgentrixError::SessionNotFound(_) | AgentrixError::NotFound(_) => ErrorCode::NotFound,
            AgentrixError::Conflict(_) | AgentrixError::SessionClosed(_) => ErrorCode::Conflict,
            AgentrixError::RateLimited { .. } => ErrorCode::RateLimited,
            AgentrixError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            AgentrixError::ProcessSpawn(_)
            | AgentrixError::Pty(_)
            | AgentrixError::Io(_)
            | AgentrixError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Convert to protocol error code and a message safe to show clients.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AgentrixError::Io(_) => (ErrorCode::InternalError, "internal I/O error".to_string()),
            _ => (self.code(), self.to_string()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        AgentrixError::Internal(anyhow::anyhow!(message.into()))
    }

    /// Recover a typed error a collaborator wrapped in `anyhow`. Anything
    /// else becomes [`AgentrixError::Internal`].
    pub fn from_service(error: anyhow::Error) -> Self {
        match error.downcast::<AgentrixError>() {
            Ok(typed) => typed,
            Err(other) => AgentrixError::Internal(other),
        }
    }
}
