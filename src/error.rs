//! Error types shared across the translation gateway.
//!
//! Worker-level failures are split into two classes: connection-class errors
//! (the worker process or its transport is compromised and must be restarted)
//! and fatal errors (the request itself was rejected). The dispatcher retries
//! the former and surfaces the latter unchanged.

use thiserror::Error;

/// Errors produced by the translation pipeline.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("manager not running")]
    NotRunning,

    #[error("manager is not in stopped state")]
    InvalidState,

    #[error("request cancelled")]
    Cancelled,

    #[error(
        "insufficient memory to create new worker: available {available_mb}MB, need at least {required_mb}MB"
    )]
    InsufficientMemory { available_mb: u64, required_mb: u64 },

    #[error("no model available for {from} -> {to}")]
    ModelMissing { from: String, to: String },

    #[error("worker connection failed, restarting: {0}")]
    WorkerTransient(String),

    #[error("worker error: {0}")]
    WorkerFatal(String),

    #[error("worker start timeout")]
    StartTimeout,

    #[error("restart timeout waiting for worker readiness")]
    RestartTimeout,

    #[error("failed to detect source language")]
    DetectionFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TranslateError {
    /// Whether the dispatcher should retry this failure on another manager.
    ///
    /// `NotRunning` is retryable because a manager mid-restart rejects work
    /// immediately; a sibling worker (or the same one, post-restart) can
    /// still serve the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranslateError::WorkerTransient(_)
                | TranslateError::NotRunning
                | TranslateError::StartTimeout
                | TranslateError::RestartTimeout
        )
    }

    /// HTTP status code for this error (4xx for caller mistakes and
    /// admission refusals, 5xx for everything else).
    pub fn status_code(&self) -> u16 {
        match self {
            TranslateError::InvalidRequest(_) => 400,
            TranslateError::ModelMissing { .. } => 404,
            TranslateError::InsufficientMemory { .. } => 429,
            TranslateError::Cancelled => 499,
            _ => 500,
        }
    }
}

/// Substrings that identify a connection-class failure in a transport error
/// message. The worker protocol carries engine crashes as plain text, so the
/// manager classifies by message content in addition to the client's
/// disconnected flag.
const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "not connected",
    "failed to send message",
    "failed to read response",
    "module closed",
    "exit_code",
    "wasm error",
    "invalid table access",
    "Translation engine not ready",
    "code 503",
];

/// Returns true when the error text matches the connection-error set.
pub fn is_connection_error_message(msg: &str) -> bool {
    CONNECTION_ERROR_MARKERS.iter().any(|m| msg.contains(m))
}
