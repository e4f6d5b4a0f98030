// Errors shared by the collaborator facades

use thiserror::Error;

/// Errors from outbound collaborators (agent orchestrator, notification
/// providers, VCS providers)
///
/// These are treated as transient by callers: subject to retry, surfaced
/// on exhaustion.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// The provider rejected or failed the request
    #[error("provider error: {0}")]
    Provider(String),

    /// The adapter does not support the requested operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The provider did not answer within the allotted time
    #[error("provider timed out: {0}")]
    Timeout(String),
}

impl OutboundError {
    pub fn provider(msg: impl Into<String>) -> Self {
        OutboundError::Provider(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        OutboundError::Unsupported(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        OutboundError::Timeout(msg.into())
    }
}
