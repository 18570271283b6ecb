//! 协议错误 - 本地 socket 与 HTTP bridge 共用的错误码

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// 返回给调用方的协议错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unknown request: {0}")]
    UnknownCommand(String),
    #[error("invalid pid: {0}")]
    InvalidPid(String),
    #[error("pi pid not found: {0}")]
    PidNotFound(u32),
    #[error("message is empty")]
    EmptyMessage,
    #[error("message too long (max {0} chars)")]
    MessageTooLong(usize),
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("send rate limit exceeded")]
    RateLimited,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// 稳定的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::BadRequest(_) => "bad_request",
            ProtocolError::UnknownCommand(_) => "unknown_command",
            ProtocolError::InvalidPid(_) => "invalid_pid",
            ProtocolError::PidNotFound(_) => "pid_not_found",
            ProtocolError::EmptyMessage => "empty_message",
            ProtocolError::MessageTooLong(_) => "message_too_long",
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::Unauthorized => "unauthorized",
            ProtocolError::Forbidden => "forbidden",
            ProtocolError::RateLimited => "rate_limited",
            ProtocolError::NotFound => "not_found",
            ProtocolError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::BadRequest(_)
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::InvalidPid(_)
            | ProtocolError::EmptyMessage
            | ProtocolError::MessageTooLong(_)
            | ProtocolError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            ProtocolError::PidNotFound(_) | ProtocolError::NotFound => StatusCode::NOT_FOUND,
            ProtocolError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProtocolError::Forbidden => StatusCode::FORBIDDEN,
            ProtocolError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProtocolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `{"ok":false,"error":...,"code":...}`
    pub fn to_json(&self) -> Value {
        json!({
            "ok": false,
            "error": self.to_string(),
            "code": self.code(),
        })
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_json())).into_response()
    }
}

impl From<anyhow::Error> for ProtocolError {
    fn from(err: anyhow::Error) -> Self {
        ProtocolError::Internal(err.to_string())
    }
}
