//! In-VM coding agent
//!
//! The agent binary runs this module inside a disposable VM. It owns the
//! cloned repository and drives the model one tool call at a time:
//!
//! ```text
//! TaskConfig → AgentLoop → LlmClient (tools: list/read/write/search/run/status/diff/complete)
//!                  ↓
//!           AgentAction ──run_command──→ safety gate ──allow──→ sh -c in workspace
//!                  ↓                                    └─deny──→ PolicyViolation event, re-prompt
//!           task_complete → verify command → git commit → git push
//!                  ↓
//!           progress.jsonl (one `done` event closes the run)
//! ```

pub mod action;
pub mod controller;
pub mod git;
pub mod shell;
pub mod verify;
pub mod workspace;

pub use action::{parse_reply, AgentAction, ParsedReply};
pub use controller::{AgentLoop, AgentPhase, AgentReport, AgentSettings, AgentStep, DEFAULT_AGENT_SYSTEM_PROMPT};
pub use git::{git_available, CloneFailure, Git, GitError};
pub use shell::{run_shell, truncate_text, ShellOutput};
pub use verify::detect_verify_command;
pub use workspace::{RepoWorkspace, SearchMatch, WorkspaceError};
