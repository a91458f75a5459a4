use std::time::Duration;
use thiserror::Error;

/// Short message shown to the user when a turn cannot be completed.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Sorry, I ran into a problem while working on that. Please try again in a moment.";

/// Typed error hierarchy for the runtime.
///
/// Use at module boundaries (model calls, dispatch, subagent control, config reload).
/// Internal/leaf functions can continue using `anyhow::Result`; the `Internal` variant
/// allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Admission denied: retry in {}s", reset_in.as_secs().max(1))]
    AdmissionDenied { reset_in: Duration },

    #[error("Model unavailable: {message}")]
    ModelUnavailable { message: String, retryable: bool },

    #[error("Upstream rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Compaction failed: {0}")]
    CompactionFailed(String),

    #[error("Subagent run '{0}' not found")]
    SubagentNotFound(String),

    #[error("Subagent run '{0}' is already running")]
    SubagentAlreadyRunning(String),

    #[error("Configuration unchanged; nothing to reload")]
    ConfigReloadNoop,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Whether this error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ModelUnavailable { retryable, .. } => *retryable,
            Self::RateLimited { .. } | Self::Internal(_) => true,
            Self::AdmissionDenied { .. }
            | Self::Auth(_)
            | Self::ToolExecution { .. }
            | Self::CompactionFailed(_)
            | Self::SubagentNotFound(_)
            | Self::SubagentAlreadyRunning(_)
            | Self::ConfigReloadNoop
            | Self::Config(_) => false,
        }
    }
}

/// Classify an `anyhow` error from a model call. Errors that are not a
/// `RuntimeError` (network, decode) are treated as transient.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RuntimeError>()
        .is_none_or(RuntimeError::is_retryable)
}

/// Upstream `retry-after` hint in seconds, if the error carries one.
pub fn retry_after_hint(err: &anyhow::Error) -> Option<u64> {
    match err.downcast_ref::<RuntimeError>() {
        Some(RuntimeError::RateLimited { retry_after }) => *retry_after,
        _ => None,
    }
}
