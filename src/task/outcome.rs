//! Terminal results and the user-facing error taxonomy.

use serde::{Deserialize, Serialize};

/// Error kinds surfaced to the orchestrator on the closing progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad credentials, template or settings. Fatal, never retried.
    ConfigurationError,
    /// Transient infrastructure failure that outlived its retries.
    ProvisioningError,
    /// The VM never became reachable.
    ReadinessTimeoutError,
    /// Clone, authentication or branch failure.
    RepositoryError,
    /// A proposed command was denied by the safety gate.
    PolicyViolation,
    /// Tests or build kept failing after the allowed retries.
    VerificationFailure,
    /// Commit or push failed.
    CommitError,
    /// Deadline or step ceiling exceeded.
    TimeoutError,
    /// The LLM endpoint kept failing.
    LlmError,
    /// No progress events within the liveness timeout.
    AgentUnresponsive,
    /// The user aborted the task.
    Cancelled,
    /// A run panicked.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::ProvisioningError => "provisioning_error",
            ErrorKind::ReadinessTimeoutError => "readiness_timeout_error",
            ErrorKind::RepositoryError => "repository_error",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::VerificationFailure => "verification_failure",
            ErrorKind::CommitError => "commit_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::LlmError => "llm_error",
            ErrorKind::AgentUnresponsive => "agent_unresponsive",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Whether this kind may be absorbed inside one loop iteration.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::PolicyViolation | ErrorKind::VerificationFailure)
    }

    /// Short explanation for chat rendering.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "The coding environment is misconfigured.",
            ErrorKind::ProvisioningError => "Could not provision a VM for the task.",
            ErrorKind::ReadinessTimeoutError => "The VM never became reachable.",
            ErrorKind::RepositoryError => "The repository could not be cloned.",
            ErrorKind::PolicyViolation => "The agent kept proposing forbidden commands.",
            ErrorKind::VerificationFailure => "Tests or build still fail after retries.",
            ErrorKind::CommitError => "The changes could not be committed or pushed.",
            ErrorKind::TimeoutError => "The task ran out of time or steps.",
            ErrorKind::LlmError => "The language model endpoint kept failing.",
            ErrorKind::AgentUnresponsive => "The agent stopped reporting progress.",
            ErrorKind::Cancelled => "The task was cancelled.",
            ErrorKind::InternalError => "An internal error interrupted the task.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::Failed => "failed",
            TerminalStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single result of one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TerminalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Human-readable cause (failure) or summary (success).
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Commit id, when one was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(
        summary: impl Into<String>,
        files_changed: Vec<String>,
        commit: Option<String>,
    ) -> Self {
        Self {
            status: TerminalStatus::Succeeded,
            error_kind: None,
            reason: summary.into(),
            files_changed,
            commit,
        }
    }

    pub fn failed(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            error_kind: Some(kind),
            reason: reason.into(),
            files_changed: Vec::new(),
            commit: None,
        }
    }

    /// Deadline reached, or a cancellation treated like one.
    pub fn timed_out(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::TimedOut,
            error_kind: Some(kind),
            reason: reason.into(),
            files_changed: Vec::new(),
            commit: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_changed = files;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Succeeded
    }
}
