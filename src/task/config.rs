//! Immutable task request injected into the agent VM.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// One coding task, exactly as delivered to the agent.
///
/// The JSON form is the task injection format. `llm_endpoint` and
/// `llm_api_key` also accept the `openwebui_*` names older templates write.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    pub task_id: String,
    pub repository_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub task_description: String,
    /// Model id from the invoking chat, passed through unchanged.
    pub model: String,
    /// OpenAI-compatible base URL (e.g. `http://webui:3000/api`).
    #[serde(alias = "openwebui_api_url")]
    pub llm_endpoint: String,
    #[serde(default, alias = "openwebui_api_key")]
    pub llm_api_key: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Push the commit to `origin` after committing.
    #[serde(default = "default_push")]
    pub push: bool,
    /// Overrides verification command detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<String>,
    /// Overrides the agent's step ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_push() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TaskConfigError {
    #[error("failed to read task config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid task config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid task config: {0}")]
    Invalid(String),
}

impl TaskConfig {
    /// Build a new task with a fresh id and a deadline `max_duration` from now.
    pub fn new(
        repository_url: impl Into<String>,
        branch: impl Into<String>,
        task_description: impl Into<String>,
        model: impl Into<String>,
        llm_endpoint: impl Into<String>,
        llm_api_key: impl Into<String>,
        max_duration: std::time::Duration,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = created_at
            + Duration::from_std(max_duration).unwrap_or_else(|_| Duration::hours(1));
        Self {
            task_id: Uuid::now_v7().to_string(),
            repository_url: repository_url.into(),
            branch: branch.into(),
            task_description: task_description.into(),
            model: model.into(),
            llm_endpoint: llm_endpoint.into(),
            llm_api_key: llm_api_key.into(),
            created_at,
            deadline,
            push: true,
            verify_command: None,
            max_steps: None,
        }
    }

    pub fn validate(&self) -> Result<(), TaskConfigError> {
        let required = [
            ("task_id", &self.task_id),
            ("repository_url", &self.repository_url),
            ("branch", &self.branch),
            ("task_description", &self.task_description),
            ("model", &self.model),
            ("llm_endpoint", &self.llm_endpoint),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(TaskConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.deadline <= self.created_at {
            return Err(TaskConfigError::Invalid(
                "deadline must be later than created_at".to_string(),
            ));
        }
        if self.branch.starts_with('-') || self.branch.contains("..") {
            return Err(TaskConfigError::Invalid(format!(
                "branch name '{}' is not allowed",
                self.branch
            )));
        }
        if self.max_steps == Some(0) {
            return Err(TaskConfigError::Invalid("max_steps must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TaskConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| TaskConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: TaskConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, TaskConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Short, name-safe suffix used for VM names and tags.
    pub fn short_id(&self) -> String {
        let compact: String = self
            .task_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let start = compact.len().saturating_sub(12);
        compact[start..].to_string()
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> std::time::Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }
}

impl std::fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskConfig")
            .field("task_id", &self.task_id)
            .field("repository_url", &self.repository_url)
            .field("branch", &self.branch)
            .field("task_description", &self.task_description)
            .field("model", &self.model)
            .field("llm_endpoint", &self.llm_endpoint)
            .field("llm_api_key", &"<redacted>")
            .field("deadline", &self.deadline)
            .field("push", &self.push)
            .finish()
    }
}
