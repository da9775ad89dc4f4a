//! Agent Execution Loop - bounded LLM-driven edit/test/commit cycle
//!
//! The AgentLoop runs inside the agent VM. It clones the task's repository,
//! then alternates between asking the model for one action and executing it,
//! until the model declares completion, the step ceiling is hit, or the
//! task deadline passes. Every observable step lands on the progress channel.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::llm::{agent_tools, ChatError, ChatMessage, LlmClient, Tool};
use crate::metrics::{AGENT_STEPS, LLM_CALL_DURATION, POLICY_VIOLATIONS, VERIFY_RUNS};
use crate::progress::{EventKind, EventPayload, EventStore, ProgressWriter};
use crate::safety::{evaluate_with, SafetyPolicy};
use crate::task::{ErrorKind, TaskConfig, TaskOutcome, TerminalStatus};

use super::action::{parse_reply, AgentAction, ParsedReply};
use super::git::Git;
use super::shell::{run_shell, truncate_text};
use super::verify::detect_verify_command;
use super::workspace::RepoWorkspace;

/// Tunables for the agent loop. Task-specific values come from [`TaskConfig`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Directory the repository is cloned into
    pub workspace_dir: PathBuf,
    /// Hard ceiling on LLM steps, shared by planning and verification retries
    pub max_steps: usize,
    /// Failed verification runs tolerated before the task fails
    pub max_verify_retries: usize,
    /// Denied commands tolerated before the task fails (`None` = only the step ceiling applies)
    pub max_policy_violations: Option<usize>,
    /// Consecutive LLM failures tolerated
    pub max_llm_failures: usize,
    pub llm_retry_delay: Duration,
    pub command_timeout: Duration,
    pub llm_timeout: Duration,
    pub clone_timeout: Duration,
    pub max_file_size: u64,
    /// Tool results are cut to this many characters before going back to the model
    pub max_tool_output: usize,
    pub commit_author_name: String,
    pub commit_author_email: String,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("/home/agent/workspace"),
            max_steps: 50,
            max_verify_retries: 3,
            max_policy_violations: None,
            max_llm_failures: 3,
            llm_retry_delay: Duration::from_secs(2),
            command_timeout: Duration::from_secs(300),
            llm_timeout: Duration::from_secs(120),
            clone_timeout: Duration::from_secs(300),
            max_file_size: 1024 * 1024,
            max_tool_output: 10_000,
            commit_author_name: "Autonomous Coding Agent".to_string(),
            commit_author_email: "agent@codevisor.local".to_string(),
            system_prompt: None,
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Initializing,
    Cloning,
    Planning,
    Acting,
    Verifying,
    Committing,
    Done,
    Succeeded,
    Failed,
    TimedOut,
}

impl AgentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Succeeded | AgentPhase::Failed | AgentPhase::TimedOut)
    }
}

impl From<TerminalStatus> for AgentPhase {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Succeeded => AgentPhase::Succeeded,
            TerminalStatus::Failed => AgentPhase::Failed,
            TerminalStatus::TimedOut => AgentPhase::TimedOut,
        }
    }
}

/// Record of one loop iteration, kept only for the run's duration.
#[derive(Debug, Clone)]
pub struct AgentStep {
    pub step_index: usize,
    pub action: AgentAction,
    /// Start of the result fed back to the model
    pub result_preview: String,
    pub duration: Duration,
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub outcome: TaskOutcome,
    pub steps: Vec<AgentStep>,
    /// Unique trace ID for this agent run
    pub trace_id: String,
}

enum StepFlow {
    Continue(String),
    Finish(TaskOutcome),
}

enum VerifyResult {
    Passed,
    Skipped(String),
    Failed(String),
}

/// Default system prompt for the coding agent
pub const DEFAULT_AGENT_SYSTEM_PROMPT: &str = r#"You are an autonomous coding agent working inside a disposable VM on a cloned git repository.

Work in small steps. Each reply must contain exactly one tool call:
- list_files, read_file and search_files to understand the code
- write_file to create or replace a file (always send the complete content)
- run_command for builds, tests and package managers
- git_status to see which files changed, git_diff to review the changes
- task_complete when the task is done, with a summary and a commit message

Guidelines:
- Read the relevant code before changing it
- Only package managers, language runtimes, read-only file tools and git may be run; other commands are denied
- If a command is denied, do not retry it; choose an allowed alternative
- The repository's tests run automatically when you call task_complete; fix any failures they report
- Keep changes focused on the task"#;

/// Agent loop driving one task from clone to commit
pub struct AgentLoop<L: LlmClient, S: EventStore> {
    llm: L,
    progress: ProgressWriter<S>,
    settings: AgentSettings,
    policy: SafetyPolicy,
    tools: Vec<Tool>,
    phase: AgentPhase,
    step: usize,
    steps: Vec<AgentStep>,
    written: Vec<String>,
    llm_failures: usize,
    verify_failures: usize,
    policy_violations: usize,
}

impl<L: LlmClient, S: EventStore> AgentLoop<L, S> {
    pub fn new(llm: L, store: S, settings: AgentSettings) -> Self {
        Self {
            llm,
            progress: ProgressWriter::new(store),
            settings,
            policy: SafetyPolicy::default(),
            tools: agent_tools(),
            phase: AgentPhase::Initializing,
            step: 0,
            steps: Vec::new(),
            written: Vec::new(),
            llm_failures: 0,
            verify_failures: 0,
            policy_violations: 0,
        }
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// Run the task to a terminal state and write the closing event.
    pub async fn run(mut self, task: &TaskConfig) -> AgentReport {
        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_run",
            trace_id = %trace_id,
            task_id = %task.task_id,
            model = %task.model,
            otel.name = "agent_run"
        );

        async move {
            info!(task_id = %task.task_id, repo = %task.repository_url, "Starting agent run");

            let remaining = task.remaining();
            let outcome = if remaining.is_zero() {
                TaskOutcome::timed_out(ErrorKind::TimeoutError, "deadline passed before the run started")
            } else {
                let result = tokio::time::timeout(remaining, self.execute(task)).await;
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(task_id = %task.task_id, step = self.step, "Deadline reached");
                        TaskOutcome::timed_out(
                            ErrorKind::TimeoutError,
                            format!("deadline reached during step {}", self.step),
                        )
                    }
                }
            };

            let outcome = self.finish(outcome).await;
            AgentReport {
                outcome,
                steps: self.steps,
                trace_id,
            }
        }
        .instrument(root_span)
        .await
    }

    async fn finish(&mut self, mut outcome: TaskOutcome) -> TaskOutcome {
        self.set_phase(AgentPhase::Done);
        if !outcome.is_success() && outcome.files_changed.is_empty() {
            outcome.files_changed = self.written.clone();
        }
        AGENT_STEPS.observe(self.step as f64);
        self.set_phase(outcome.status.into());

        info!(
            status = %outcome.status,
            error_kind = ?outcome.error_kind,
            steps = self.step,
            files = outcome.files_changed.len(),
            "Agent run finished"
        );
        if let Err(e) = self.progress.done(outcome.clone()).await {
            error!(error = %e, "Failed to write closing progress event");
        }
        outcome
    }

    async fn execute(&mut self, task: &TaskConfig) -> TaskOutcome {
        self.set_phase(AgentPhase::Initializing);
        self.emit(
            EventKind::Info,
            format!("Task {} started with model {}", task.task_id, task.model),
            None,
        )
        .await;

        let repo_dir = match prepare_repo_dir(&self.settings.workspace_dir, &task.repository_url) {
            Ok(dir) => dir,
            Err(e) => {
                let reason = format!("cannot prepare workspace: {e}");
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::ConfigurationError, reason);
            }
        };

        self.set_phase(AgentPhase::Cloning);
        self.emit(
            EventKind::Info,
            format!("Cloning {} (branch {})", task.repository_url, task.branch),
            None,
        )
        .await;
        let workspace = match self.clone_workspace(task, &repo_dir).await {
            Ok(ws) => ws,
            Err(reason) => {
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::RepositoryError, reason);
            }
        };

        let listing = workspace.list_files("", false).unwrap_or_default();
        let verify_command = detect_verify_command(workspace.root(), task.verify_command.as_deref());
        self.emit(
            EventKind::Info,
            format!(
                "Repository ready ({} top-level entries, verification: {})",
                listing.len(),
                verify_command.as_deref().unwrap_or("none")
            ),
            None,
        )
        .await;

        let system_prompt = self
            .settings
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_AGENT_SYSTEM_PROMPT.to_string());
        let mut messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(initial_prompt(task, &listing, verify_command.as_deref())),
        ];
        let max_steps = task.max_steps.unwrap_or(self.settings.max_steps);

        loop {
            if self.step >= max_steps {
                let reason = format!("step ceiling of {max_steps} reached without completion");
                warn!(steps = self.step, "Step ceiling reached");
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::TimeoutError, reason);
            }
            self.step += 1;
            self.set_phase(AgentPhase::Planning);

            let request = self.build_request(&messages, &workspace, max_steps, task).await;
            let reply = match self.call_llm(task, &request).await {
                Ok(reply) => {
                    self.llm_failures = 0;
                    assign_call_ids(reply, self.step)
                }
                Err(e) => {
                    self.llm_failures += 1;
                    warn!(step = self.step, failures = self.llm_failures, error = %e, "LLM call failed");
                    self.emit(EventKind::Error, format!("LLM call failed: {e}"), None).await;
                    if self.llm_failures >= self.settings.max_llm_failures {
                        return TaskOutcome::failed(
                            ErrorKind::LlmError,
                            format!("{} consecutive LLM failures, last: {e}", self.llm_failures),
                        );
                    }
                    tokio::time::sleep(self.settings.llm_retry_delay).await;
                    continue;
                }
            };

            let parsed = parse_reply(&reply);
            messages.push(assistant_record(&reply, &parsed));
            if !reply.content.trim().is_empty() {
                self.emit(EventKind::Thought, truncate_text(reply.content.trim(), 500), None)
                    .await;
            }

            self.set_phase(AgentPhase::Acting);
            let started = Instant::now();
            debug!(step = self.step, action = parsed.action.name(), "Executing action");
            let flow = self
                .act(&parsed.action, &workspace, task, verify_command.as_deref())
                .await;

            let mut result = match flow {
                StepFlow::Continue(text) => text,
                StepFlow::Finish(outcome) => {
                    self.record_step(&parsed.action, outcome.reason.clone(), started);
                    return outcome;
                }
            };
            if parsed.ignored_calls > 0 {
                result.push_str(&format!(
                    "\n(Only the first tool call was executed; {} more were ignored.)",
                    parsed.ignored_calls
                ));
            }
            self.record_step(&parsed.action, result.clone(), started);
            messages.push(result_message(&parsed, result));
        }
    }

    async fn clone_workspace(&self, task: &TaskConfig, repo_dir: &Path) -> Result<RepoWorkspace, String> {
        let git = Git::clone_repo(
            &task.repository_url,
            &task.branch,
            repo_dir,
            self.settings.clone_timeout,
        )
        .await
        .map_err(|e| format!("clone of {} failed: {e}", task.repository_url))?;
        git.configure_identity(&self.settings.commit_author_name, &self.settings.commit_author_email)
            .await
            .map_err(|e| format!("cannot configure git identity: {e}"))?;
        RepoWorkspace::new(git, &task.branch, self.settings.max_file_size)
            .map_err(|e| format!("cannot open workspace: {e}"))
    }

    async fn act(
        &mut self,
        action: &AgentAction,
        ws: &RepoWorkspace,
        task: &TaskConfig,
        verify_command: Option<&str>,
    ) -> StepFlow {
        let limit = self.settings.max_tool_output;
        match action {
            AgentAction::ListFiles { path, recursive } => match ws.list_files(path, *recursive) {
                Ok(entries) => {
                    self.emit(EventKind::Tool, action.describe(), None).await;
                    let text = if entries.is_empty() {
                        "(empty directory)".to_string()
                    } else {
                        entries.join("\n")
                    };
                    StepFlow::Continue(truncate_text(&text, limit))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::ReadFile { path } => match ws.read_file(path) {
                Ok(content) => {
                    let payload = EventPayload::File {
                        path: path.clone(),
                        bytes: content.len() as u64,
                    };
                    self.emit(EventKind::Tool, action.describe(), Some(payload)).await;
                    StepFlow::Continue(truncate_text(&content, limit))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::WriteFile { path, content } => match ws.write_file(path, content) {
                Ok(bytes) => {
                    if !self.written.contains(path) {
                        self.written.push(path.clone());
                    }
                    let payload = EventPayload::File {
                        path: path.clone(),
                        bytes,
                    };
                    self.emit(EventKind::Tool, format!("Wrote {path} ({bytes} bytes)"), Some(payload))
                        .await;
                    StepFlow::Continue(format!("Wrote {bytes} bytes to {path}"))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::SearchFiles { pattern, path } => match ws.search(pattern, path) {
                Ok(matches) => {
                    self.emit(
                        EventKind::Tool,
                        format!("{} ({} matches)", action.describe(), matches.len()),
                        None,
                    )
                    .await;
                    let text = if matches.is_empty() {
                        "No matches.".to_string()
                    } else {
                        matches
                            .iter()
                            .map(|m| format!("{}:{}: {}", m.path, m.line_number, m.line))
                            .collect::<Vec<_>>()
                            .join("\n")
                    };
                    StepFlow::Continue(truncate_text(&text, limit))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::RunCommand { command } => self.run_command(command, ws).await,
            AgentAction::GitStatus => match ws.git().status_porcelain().await {
                Ok(entries) => {
                    self.emit(EventKind::Tool, action.describe(), None).await;
                    let text = if entries.is_empty() {
                        "Working tree clean.".to_string()
                    } else {
                        entries
                            .iter()
                            .map(|e| format!("{} {}", e.code, e.path))
                            .collect::<Vec<_>>()
                            .join("\n")
                    };
                    StepFlow::Continue(truncate_text(&text, limit))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::GitDiff => match ws.diff_patch().await {
                Ok(patch) => {
                    self.emit(EventKind::Tool, action.describe(), None).await;
                    let diff = String::from_utf8_lossy(&patch);
                    let text = if diff.trim().is_empty() {
                        "No changes yet.".to_string()
                    } else {
                        diff.into_owned()
                    };
                    StepFlow::Continue(truncate_text(&text, limit))
                }
                Err(e) => self.tool_error(action, e).await,
            },
            AgentAction::Complete {
                summary,
                commit_message,
            } => {
                self.emit(EventKind::Info, action.describe(), None).await;
                self.complete(summary, commit_message, ws, task, verify_command)
                    .await
            }
            AgentAction::Unparseable { reason } => {
                self.emit(EventKind::Error, action.describe(), None).await;
                StepFlow::Continue(format!(
                    "Error: {reason}. Reply with exactly one call to one of the provided tools; \
                     call task_complete when the task is finished."
                ))
            }
        }
    }

    async fn run_command(&mut self, command: &str, ws: &RepoWorkspace) -> StepFlow {
        let verdict = evaluate_with(command, &self.policy);
        if verdict.is_denied() {
            self.policy_violations += 1;
            POLICY_VIOLATIONS
                .with_label_values(&[verdict.matched_rule.as_str()])
                .inc();
            warn!(command, rule = %verdict.matched_rule, "Command denied by safety gate");
            let payload = EventPayload::PolicyViolation {
                command: command.to_string(),
                rule: verdict.matched_rule,
                reason: verdict.reason.clone(),
            };
            self.emit(
                EventKind::Error,
                format!("Denied `{command}`: {}", verdict.reason),
                Some(payload),
            )
            .await;

            if let Some(cap) = self.settings.max_policy_violations {
                if self.policy_violations >= cap {
                    return StepFlow::Finish(TaskOutcome::failed(
                        ErrorKind::PolicyViolation,
                        format!("{} commands denied by the safety policy", self.policy_violations),
                    ));
                }
            }
            return StepFlow::Continue(format!(
                "Command denied by the safety policy (rule: {}): {}. Do not retry it; use an allowed alternative.",
                verdict.matched_rule, verdict.reason
            ));
        }

        match run_shell(command, ws.root(), self.settings.command_timeout, self.settings.max_tool_output).await {
            Ok(output) => {
                let payload = EventPayload::Command {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                };
                let status = match (output.timed_out, output.exit_code) {
                    (true, _) => "timed out".to_string(),
                    (false, Some(code)) => format!("exit {code}"),
                    (false, None) => "killed".to_string(),
                };
                self.emit(EventKind::Tool, format!("Ran `{command}` ({status})"), Some(payload))
                    .await;
                StepFlow::Continue(output.render(self.settings.max_tool_output))
            }
            Err(e) => {
                self.emit(EventKind::Error, format!("Could not start `{command}`: {e}"), None)
                    .await;
                StepFlow::Continue(format!("Error: could not start command: {e}"))
            }
        }
    }

    async fn complete(
        &mut self,
        summary: &str,
        commit_message: &str,
        ws: &RepoWorkspace,
        task: &TaskConfig,
        verify_command: Option<&str>,
    ) -> StepFlow {
        if let Some(command) = verify_command {
            self.set_phase(AgentPhase::Verifying);
            match self.verify(command, ws).await {
                VerifyResult::Passed => {}
                VerifyResult::Skipped(reason) => {
                    self.emit(EventKind::Info, format!("Verification skipped: {reason}"), None)
                        .await;
                }
                VerifyResult::Failed(output) => {
                    self.verify_failures += 1;
                    if self.verify_failures > self.settings.max_verify_retries {
                        let reason = format!(
                            "`{command}` still failing after {} verification runs",
                            self.verify_failures
                        );
                        self.emit(EventKind::Error, reason.clone(), None).await;
                        return StepFlow::Finish(TaskOutcome::failed(ErrorKind::VerificationFailure, reason));
                    }
                    let left = self.settings.max_verify_retries + 1 - self.verify_failures;
                    return StepFlow::Continue(format!(
                        "Verification failed, so nothing was committed.\n`{command}` output:\n{output}\n\
                         Fix the problem and call task_complete again ({left} verification runs left)."
                    ));
                }
            }
        }

        self.set_phase(AgentPhase::Committing);
        StepFlow::Finish(self.commit(summary, commit_message, ws, task).await)
    }

    async fn verify(&mut self, command: &str, ws: &RepoWorkspace) -> VerifyResult {
        let verdict = evaluate_with(command, &self.policy);
        if verdict.is_denied() {
            VERIFY_RUNS.with_label_values(&["skipped"]).inc();
            return VerifyResult::Skipped(format!("`{command}` is not allowed: {}", verdict.reason));
        }

        self.emit(EventKind::Info, format!("Verifying with `{command}`"), None).await;
        let output = match run_shell(command, ws.root(), self.settings.command_timeout, self.settings.max_tool_output).await {
            Ok(output) => output,
            Err(e) => {
                VERIFY_RUNS.with_label_values(&["skipped"]).inc();
                return VerifyResult::Skipped(format!("could not start `{command}`: {e}"));
            }
        };

        let passed = output.success();
        VERIFY_RUNS
            .with_label_values(&[if passed { "passed" } else { "failed" }])
            .inc();
        let payload = EventPayload::Verification {
            command: command.to_string(),
            passed,
        };
        let (kind, message) = if passed {
            (EventKind::Tool, format!("Verification passed: `{command}`"))
        } else {
            (EventKind::Error, format!("Verification failed: `{command}`"))
        };
        self.emit(kind, message, Some(payload)).await;

        if passed {
            VerifyResult::Passed
        } else {
            VerifyResult::Failed(output.render(self.settings.max_tool_output))
        }
    }

    async fn commit(
        &mut self,
        summary: &str,
        commit_message: &str,
        ws: &RepoWorkspace,
        task: &TaskConfig,
    ) -> TaskOutcome {
        let files = match ws.changed_files().await {
            Ok(files) => files,
            Err(e) => {
                let reason = format!("cannot stage changes: {e}");
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::CommitError, reason);
            }
        };
        if files.is_empty() {
            self.emit(EventKind::Info, "No changes to commit", None).await;
            return TaskOutcome::succeeded(format!("{summary} (no file changes were needed)"), vec![], None);
        }

        let sha = match ws.git().commit(commit_message).await {
            Ok(sha) => sha,
            Err(e) => {
                let reason = format!("commit failed: {e}");
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::CommitError, reason).with_files(files);
            }
        };
        let short = sha.chars().take(8).collect::<String>();
        let title = commit_message.lines().next().unwrap_or_default().to_string();
        self.emit(EventKind::Tool, format!("Committed {short}: {title}"), None).await;

        if task.push {
            self.emit(EventKind::Info, format!("Pushing to origin/{}", ws.branch()), None)
                .await;
            if let Err(e) = ws.git().push(ws.branch()).await {
                let reason = format!("push to {} failed: {e}", ws.branch());
                self.emit(EventKind::Error, reason.clone(), None).await;
                return TaskOutcome::failed(ErrorKind::CommitError, reason).with_files(files);
            }
        }

        TaskOutcome::succeeded(summary, files, Some(sha))
    }

    async fn tool_error(&mut self, action: &AgentAction, error: impl std::fmt::Display) -> StepFlow {
        let message = format!("{} failed: {error}", action.name());
        self.emit(EventKind::Error, message.clone(), None).await;
        StepFlow::Continue(format!("Error: {message}"))
    }

    async fn build_request(
        &self,
        messages: &[ChatMessage],
        ws: &RepoWorkspace,
        max_steps: usize,
        task: &TaskConfig,
    ) -> Vec<ChatMessage> {
        let diff_stat = ws.diff_stat().await.unwrap_or_default();
        let files = if self.written.is_empty() {
            "none".to_string()
        } else {
            self.written.join(", ")
        };
        let mut note = format!(
            "[status] Step {}/{} | {}s until deadline | files written: {}",
            self.step,
            max_steps,
            task.remaining().as_secs(),
            files
        );
        if !diff_stat.trim().is_empty() {
            note.push_str("\nDiff summary:\n");
            note.push_str(&truncate_text(diff_stat.trim_end(), 2000));
        }

        let mut request = messages.to_vec();
        request.push(ChatMessage::user(note));
        request
    }

    async fn call_llm(&self, task: &TaskConfig, request: &[ChatMessage]) -> Result<ChatMessage, ChatError> {
        let llm_span = info_span!(
            "llm_call",
            step = self.step,
            model = %task.model,
            otel.name = "llm_call"
        );
        let timeout = self.settings.llm_timeout.min(task.remaining());
        let call_start = Instant::now();

        let result = tokio::time::timeout(timeout, self.llm.chat(&task.model, request, &self.tools))
            .instrument(llm_span)
            .await;

        let elapsed = call_start.elapsed().as_secs_f64();
        LLM_CALL_DURATION.with_label_values(&[&task.model]).observe(elapsed);
        debug!(step = self.step, duration_secs = elapsed, "LLM call completed");

        match result {
            Ok(reply) => reply,
            Err(_) => Err(ChatError::Timeout),
        }
    }

    fn record_step(&mut self, action: &AgentAction, result: String, started: Instant) {
        self.steps.push(AgentStep {
            step_index: self.step,
            action: action.clone(),
            result_preview: result.chars().take(200).collect(),
            duration: started.elapsed(),
        });
    }

    fn set_phase(&mut self, phase: AgentPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, step = self.step, "Agent phase change");
            self.phase = phase;
        }
    }

    async fn emit(&mut self, kind: EventKind, message: impl Into<String>, payload: Option<EventPayload>) {
        if let Err(e) = self.progress.append(kind, message, payload).await {
            warn!(error = %e, "Failed to append progress event");
        }
    }
}

/// Fresh clone target under the workspace directory.
fn prepare_repo_dir(workspace_dir: &Path, repository_url: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(workspace_dir)?;
    let dir = workspace_dir.join(repo_dir_name(repository_url));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(dir)
}

fn repo_dir_name(repository_url: &str) -> String {
    let last = repository_url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    let name: String = last
        .trim_end_matches(".git")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "repo".to_string()
    } else {
        name
    }
}

fn initial_prompt(task: &TaskConfig, listing: &[String], verify_command: Option<&str>) -> String {
    let listing = if listing.is_empty() {
        "(empty)".to_string()
    } else {
        listing.join("\n")
    };
    let verification = match verify_command {
        Some(cmd) => format!("`{cmd}` runs automatically when you call task_complete."),
        None => "No test command was detected; verify your changes with run_command where possible.".to_string(),
    };
    format!(
        "Task: {}\n\nRepository: {} (branch {})\nTop-level entries:\n{}\n\nVerification: {}",
        task.task_description, task.repository_url, task.branch, listing, verification
    )
}

/// Native calls without ids get stable ones so tool results can reference them.
fn assign_call_ids(mut reply: ChatMessage, step: usize) -> ChatMessage {
    if let Some(calls) = reply.tool_calls.as_mut() {
        for (index, call) in calls.iter_mut().enumerate() {
            if call.id.is_empty() {
                call.id = format!("call_{step}_{index}");
            }
        }
    }
    reply
}

/// History entry for the reply, trimmed to the one call that is executed.
fn assistant_record(reply: &ChatMessage, parsed: &ParsedReply) -> ChatMessage {
    let mut record = reply.clone();
    if !parsed.from_text {
        record.tool_calls = parsed.call.clone().map(|call| vec![call]);
    }
    record
}

fn result_message(parsed: &ParsedReply, text: String) -> ChatMessage {
    match &parsed.call {
        Some(call) if !parsed.from_text => ChatMessage::tool(call.id.clone(), text),
        Some(call) => ChatMessage::user(format!("Result of {}:\n{}", call.function.name, text)),
        None => ChatMessage::user(text),
    }
}
