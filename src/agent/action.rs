//! Mapping model output onto one discrete agent action.

use serde_json::Value;

use crate::llm::{parse_tool_calls_from_text, ChatMessage, ToolCall};

/// The closed set of things the agent can do in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    ListFiles { path: String, recursive: bool },
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    SearchFiles { pattern: String, path: String },
    RunCommand { command: String },
    GitStatus,
    GitDiff,
    Complete { summary: String, commit_message: String },
    /// Fed back to the model as a recoverable error.
    Unparseable { reason: String },
}

impl AgentAction {
    pub fn name(&self) -> &'static str {
        match self {
            AgentAction::ListFiles { .. } => "list_files",
            AgentAction::ReadFile { .. } => "read_file",
            AgentAction::WriteFile { .. } => "write_file",
            AgentAction::SearchFiles { .. } => "search_files",
            AgentAction::RunCommand { .. } => "run_command",
            AgentAction::GitStatus => "git_status",
            AgentAction::GitDiff => "git_diff",
            AgentAction::Complete { .. } => "task_complete",
            AgentAction::Unparseable { .. } => "unparseable",
        }
    }

    /// One-line description for progress events.
    pub fn describe(&self) -> String {
        match self {
            AgentAction::ListFiles { path, recursive } => {
                let shown = if path.is_empty() { "." } else { path.as_str() };
                if *recursive {
                    format!("Listing {shown} (recursive)")
                } else {
                    format!("Listing {shown}")
                }
            }
            AgentAction::ReadFile { path } => format!("Reading {path}"),
            AgentAction::WriteFile { path, content } => {
                format!("Writing {path} ({} bytes)", content.len())
            }
            AgentAction::SearchFiles { pattern, .. } => format!("Searching for /{pattern}/"),
            AgentAction::RunCommand { command } => format!("Running `{command}`"),
            AgentAction::GitStatus => "Checking git status".to_string(),
            AgentAction::GitDiff => "Reviewing the diff".to_string(),
            AgentAction::Complete { summary, .. } => format!("Declared completion: {summary}"),
            AgentAction::Unparseable { reason } => format!("Unusable response: {reason}"),
        }
    }

    pub fn from_tool_call(call: &ToolCall) -> Self {
        let args = &call.function.arguments;
        let action = match call.function.name.as_str() {
            "list_files" => Ok(AgentAction::ListFiles {
                path: optional_str(args, "path"),
                recursive: args.get("recursive").and_then(Value::as_bool).unwrap_or(false),
            }),
            "read_file" => required_str(args, "path").map(|path| AgentAction::ReadFile { path }),
            "write_file" => required_str(args, "path").and_then(|path| {
                required_str(args, "content").map(|content| AgentAction::WriteFile { path, content })
            }),
            "search_files" => required_str(args, "pattern").map(|pattern| AgentAction::SearchFiles {
                pattern,
                path: optional_str(args, "path"),
            }),
            "run_command" | "execute_command" => required_str(args, "command")
                .and_then(|command| {
                    if command.trim().is_empty() {
                        Err("command is empty".to_string())
                    } else {
                        Ok(AgentAction::RunCommand { command })
                    }
                }),
            "git_status" => Ok(AgentAction::GitStatus),
            "git_diff" => Ok(AgentAction::GitDiff),
            "task_complete" => {
                let summary = optional_str(args, "summary");
                let commit_message = optional_str(args, "commit_message");
                let summary = if summary.trim().is_empty() {
                    commit_message.clone()
                } else {
                    summary
                };
                let commit_message = if commit_message.trim().is_empty() {
                    summary.clone()
                } else {
                    commit_message
                };
                if summary.trim().is_empty() {
                    Err("task_complete needs a summary and a commit_message".to_string())
                } else {
                    Ok(AgentAction::Complete { summary, commit_message })
                }
            }
            other => Err(format!("unknown tool '{other}'")),
        };
        action.unwrap_or_else(|reason| AgentAction::Unparseable { reason })
    }
}

fn optional_str(args: &Value, key: &str) -> String {
    args.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn required_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing string argument '{key}'"))
}

/// The action chosen from a model reply, plus the call it came from.
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub action: AgentAction,
    pub call: Option<ToolCall>,
    /// True when the call was recovered from plain text.
    pub from_text: bool,
    /// Calls beyond the first, which are not executed.
    pub ignored_calls: usize,
}

/// Pick the first tool call (native first, then text fallback).
pub fn parse_reply(message: &ChatMessage) -> ParsedReply {
    let native = message.native_tool_calls();
    let (calls, from_text) = if native.is_empty() {
        (parse_tool_calls_from_text(&message.content), true)
    } else {
        (native.to_vec(), false)
    };

    match calls.first() {
        Some(call) => ParsedReply {
            action: AgentAction::from_tool_call(call),
            call: Some(call.clone()),
            from_text,
            ignored_calls: calls.len() - 1,
        },
        None => ParsedReply {
            action: AgentAction::Unparseable {
                reason: "the reply contained no tool call".to_string(),
            },
            call: None,
            from_text,
            ignored_calls: 0,
        },
    }
}
