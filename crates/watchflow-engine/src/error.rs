// Engine error taxonomy

use thiserror::Error;
use uuid::Uuid;

use watchflow_core::browser::BrowserError;
use watchflow_core::error::OutboundError;
use watchflow_storage::StorageError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed schedule spec, unknown step/action kind, bad config
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced workflow, playbook, run, or action missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent state change; caller retries with bounded attempts
    #[error("conflict: {0}")]
    Conflict(String),

    /// execute() called while a non-terminal run exists
    #[error("workflow {0} already has a run in flight")]
    AlreadyRunning(Uuid),

    /// Run exceeded its wall-clock deadline
    #[error("run exceeded its deadline")]
    Timeout,

    /// Run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// A step exhausted its retries
    #[error("step {step_id} failed: {message}")]
    Step { step_id: String, message: String },

    /// No step is ready while none is in flight
    #[error("cyclic dependency among steps: {0}")]
    CyclicDependency(String),

    /// An action exhausted its retries
    #[error("action {action_id} failed: {message}")]
    Action { action_id: Uuid, message: String },

    /// Trigger attempt dropped by the per-workflow rate limit
    #[error("rate limit exceeded for workflow {0}")]
    RateLimitExceeded(Uuid),

    /// Webhook HMAC verification failed
    #[error("webhook signature mismatch")]
    SignatureMismatch,

    /// No webhook registration for the presented token
    #[error("invalid webhook token")]
    InvalidWebhookToken,

    /// Browser or HTTP provider failure; transient, subject to retry
    #[error("external collaborator error: {0}")]
    External(String),

    /// Underlying storage failure
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        EngineError::External(msg.into())
    }

    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Step {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(msg) => EngineError::NotFound(msg),
            StorageError::Conflict(msg) => EngineError::Conflict(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl From<BrowserError> for EngineError {
    fn from(e: BrowserError) -> Self {
        EngineError::External(e.to_string())
    }
}

impl From<OutboundError> for EngineError {
    fn from(e: OutboundError) -> Self {
        EngineError::External(e.to_string())
    }
}
