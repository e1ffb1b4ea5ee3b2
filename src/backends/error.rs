//! Error taxonomy for the backend layer.
//!
//! `SessionError` is what fallible calls return. `BackendError` is the
//! serializable record pushed onto a backend's error channel once there is no
//! synchronous caller left to receive the failure.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::channel::ProcessExit;
use super::session::SessionState;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to spawn `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Process channel is closed")]
    ChannelClosed,

    #[error("Session is not active ({0})")]
    SessionClosed(SessionState),

    #[error("Failed to create session: {0}")]
    SessionCreate(#[source] Box<SessionError>),

    #[error("Backend has been disposed")]
    BackendDisposed,

    #[error("Process exited unexpectedly ({0})")]
    UnexpectedExit(ProcessExit),

    #[error("Initialize handshake failed: {0}")]
    Handshake(String),

    #[error("Control request `{subtype}` was rejected: {message}")]
    ControlRejected { subtype: String, message: String },

    #[error("No control response within {0:?}")]
    Timeout(Duration),

    #[error("Unsupported config option `{0}`")]
    UnsupportedOption(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Wraps a construction failure, leaving already-wrapped errors and
    /// disposal errors untouched.
    pub fn into_create_error(self) -> Self {
        match self {
            SessionError::SessionCreate(_) | SessionError::BackendDisposed => self,
            other => SessionError::SessionCreate(Box::new(other)),
        }
    }

    pub fn code(&self) -> BackendErrorCode {
        match self {
            SessionError::Spawn { .. } => BackendErrorCode::SpawnFailed,
            SessionError::ChannelClosed => BackendErrorCode::ChannelClosed,
            SessionError::SessionClosed(_) => BackendErrorCode::SessionClosed,
            SessionError::SessionCreate(_) => BackendErrorCode::SessionCreateFailed,
            SessionError::BackendDisposed => BackendErrorCode::BackendDisposed,
            SessionError::UnexpectedExit(_) => BackendErrorCode::UnexpectedExit,
            SessionError::Handshake(_) => BackendErrorCode::HandshakeFailed,
            SessionError::ControlRejected { .. } => BackendErrorCode::ControlRejected,
            SessionError::Timeout(_) => BackendErrorCode::Timeout,
            SessionError::UnsupportedOption(_) => BackendErrorCode::UnsupportedOption,
            SessionError::UnknownBackend(_) => BackendErrorCode::UnknownBackend,
            SessionError::Io(_) => BackendErrorCode::Io,
            SessionError::Json(_) => BackendErrorCode::Protocol,
        }
    }

    /// Whether the caller can reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::SessionCreate(_)
                | SessionError::Spawn { .. }
                | SessionError::Handshake(_)
                | SessionError::Timeout(_)
                | SessionError::ControlRejected { .. }
        )
    }
}

/// Stable machine-readable tag for a [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorCode {
    SpawnFailed,
    ChannelClosed,
    SessionClosed,
    SessionCreateFailed,
    BackendDisposed,
    UnexpectedExit,
    HandshakeFailed,
    ControlRejected,
    Timeout,
    UnsupportedOption,
    UnknownBackend,
    Io,
    Protocol,
}

/// Error record published on a backend's error channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendError {
    pub message: String,
    pub code: BackendErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub recoverable: bool,
    pub timestamp: i64,
}

impl BackendError {
    pub fn new(code: BackendErrorCode, message: impl Into<String>, session_id: Option<&str>) -> Self {
        Self {
            message: message.into(),
            code,
            session_id: session_id.map(str::to_string),
            recoverable: false,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn from_session_error(err: &SessionError, session_id: Option<&str>) -> Self {
        Self {
            recoverable: err.is_recoverable(),
            ..Self::new(err.code(), err.to_string(), session_id)
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session_id {
            Some(id) => write!(f, "[{}] {}", id, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}
