//! Outbound collaborator facades
//!
//! The AI agent orchestrator, email/SMS providers, and VCS providers are
//! external collaborators. The engine consumes them through these traits;
//! recording stubs live alongside for tests and development.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::OutboundError;

// ============================================================================
// Agent orchestrator facade
// ============================================================================

/// Task-dispatch facade over the AI agent orchestrator
///
/// `evaluate_script` doubles as the isolated evaluator used by sandboxed
/// script actions; implementations grant it no I/O capabilities.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Dispatch a playbook as a sub-task; failure of the sub-task propagates
    async fn run_playbook(&self, playbook_id: Uuid, context: Value) -> Result<Value, OutboundError>;

    /// Evaluate inlined JavaScript against a context value
    async fn evaluate_script(
        &self,
        source: &str,
        context: Value,
        time_limit: Option<Duration>,
    ) -> Result<Value, OutboundError>;
}

/// Recording stub: returns canned responses and logs every dispatch
#[derive(Clone)]
pub struct StubAgentDispatcher {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    playbook_response: Arc<Mutex<Result<Value, String>>>,
    script_response: Arc<Mutex<Result<Value, String>>>,
}

impl Default for StubAgentDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StubAgentDispatcher {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            playbook_response: Arc::new(Mutex::new(Ok(json!({"status": "ok"})))),
            script_response: Arc::new(Mutex::new(Ok(json!({"status": "ok"})))),
        }
    }

    pub fn set_playbook_response(&self, response: Result<Value, String>) {
        *self.playbook_response.lock() = response;
    }

    pub fn set_script_response(&self, response: Result<Value, String>) {
        *self.script_response.lock() = response;
    }

    /// (operation, payload) pairs in dispatch order
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AgentDispatcher for StubAgentDispatcher {
    async fn run_playbook(&self, playbook_id: Uuid, context: Value) -> Result<Value, OutboundError> {
        self.calls
            .lock()
            .push(("run_playbook".to_string(), json!({"playbook_id": playbook_id, "context": context})));
        self.playbook_response
            .lock()
            .clone()
            .map_err(OutboundError::Provider)
    }

    async fn evaluate_script(
        &self,
        source: &str,
        context: Value,
        _time_limit: Option<Duration>,
    ) -> Result<Value, OutboundError> {
        self.calls
            .lock()
            .push(("evaluate_script".to_string(), json!({"source": source, "context": context})));
        self.script_response
            .lock()
            .clone()
            .map_err(OutboundError::Provider)
    }
}

// ============================================================================
// Notification adapters
// ============================================================================

/// Outbound email adapter
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns a provider payload (e.g. a message id)
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<Value, OutboundError>;
}

/// Outbound SMS adapter
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &[String], body: &str) -> Result<Value, OutboundError>;
}

/// Recording email stub
#[derive(Clone)]
pub struct RecordingEmailSender {
    sent: Arc<Mutex<Vec<(Vec<String>, String, String)>>>,
    response: Arc<Mutex<Result<Value, String>>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(json!({"id": "stub-email"})))),
        }
    }

    pub fn set_response(&self, response: Result<Value, String>) {
        *self.response.lock() = response;
    }

    pub fn sent(&self) -> Vec<(Vec<String>, String, String)> {
        self.sent.lock().clone()
    }
}

impl Default for RecordingEmailSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: &[String], subject: &str, body: &str) -> Result<Value, OutboundError> {
        self.sent
            .lock()
            .push((to.to_vec(), subject.to_string(), body.to_string()));
        self.response.lock().clone().map_err(OutboundError::Provider)
    }
}

/// Recording SMS stub
#[derive(Clone)]
pub struct RecordingSmsSender {
    sent: Arc<Mutex<Vec<(Vec<String>, String)>>>,
    response: Arc<Mutex<Result<Value, String>>>,
}

impl RecordingSmsSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(json!({"id": "stub-sms"})))),
        }
    }

    pub fn set_response(&self, response: Result<Value, String>) {
        *self.response.lock() = response;
    }

    pub fn sent(&self) -> Vec<(Vec<String>, String)> {
        self.sent.lock().clone()
    }
}

impl Default for RecordingSmsSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmsSender for RecordingSmsSender {
    async fn send(&self, to: &[String], body: &str) -> Result<Value, OutboundError> {
        self.sent.lock().push((to.to_vec(), body.to_string()));
        self.response.lock().clone().map_err(OutboundError::Provider)
    }
}

// ============================================================================
// VCS provider facade
// ============================================================================

/// Hosting provider inferred from a repository URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsKind {
    Github,
    Gitlab,
}

impl VcsKind {
    /// Infer the provider from a repository URL
    pub fn infer(repository_url: &str) -> Option<Self> {
        let lower = repository_url.to_ascii_lowercase();
        if lower.contains("github.com") {
            Some(VcsKind::Github)
        } else if lower.contains("gitlab") {
            Some(VcsKind::Gitlab)
        } else {
            None
        }
    }
}

/// A pull/merge request to open
#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub provider: VcsKind,
    pub repository: String,
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Outbound VCS adapter
#[async_trait]
pub trait VcsProvider: Send + Sync {
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<Value, OutboundError>;
}

/// Recording VCS stub
#[derive(Clone)]
pub struct RecordingVcsProvider {
    opened: Arc<Mutex<Vec<PullRequestSpec>>>,
    response: Arc<Mutex<Result<Value, String>>>,
}

impl RecordingVcsProvider {
    pub fn new() -> Self {
        Self {
            opened: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(Ok(json!({"number": 1, "url": "stub-pr"})))),
        }
    }

    pub fn set_response(&self, response: Result<Value, String>) {
        *self.response.lock() = response;
    }

    pub fn opened(&self) -> Vec<PullRequestSpec> {
        self.opened.lock().clone()
    }
}

impl Default for RecordingVcsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsProvider for RecordingVcsProvider {
    async fn open_pull_request(&self, spec: &PullRequestSpec) -> Result<Value, OutboundError> {
        self.opened.lock().push(spec.clone());
        self.response.lock().clone().map_err(OutboundError::Provider)
    }
}

impl FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(VcsKind::Github),
            "gitlab" => Ok(VcsKind::Gitlab),
            other => Err(format!("unknown vcs provider: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcs_inference() {
        assert_eq!(
            VcsKind::infer("https://github.com/acme/site"),
            Some(VcsKind::Github)
        );
        assert_eq!(
            VcsKind::infer("https://gitlab.example.com/acme/site"),
            Some(VcsKind::Gitlab)
        );
        assert_eq!(VcsKind::infer("https://bitbucket.org/acme/site"), None);
    }

    #[tokio::test]
    async fn test_recording_email_stub() {
        let sender = RecordingEmailSender::new();
        sender.set_response(Ok(json!({"id": "m7"})));

        let out = sender
            .send(&["ops@example.test".to_string()], "subject", "body")
            .await
            .expect("should send");
        assert_eq!(out["id"], "m7");
        assert_eq!(sender.sent().len(), 1);
    }
}
