//! Chat markdown for task updates.

use crate::progress::{EventKind, EventPayload, ProgressEvent};
use crate::task::{TaskConfig, TerminalStatus};
use crate::vm::{CleanupStatus, TaskReport, TaskUpdate, VmPhase};

const MAX_LISTED_FILES: usize = 10;

pub fn render_header(task: &TaskConfig) -> String {
    format!(
        "# Autonomous Coding Task `{}`\n\n\
         **Repository:** `{}`\n\
         **Branch:** `{}`\n\
         **Model:** `{}`\n\n\
         **Task:** {}\n\n---\n\n",
        task.short_id(),
        task.repository_url,
        task.branch,
        task.model,
        task.task_description
    )
}

/// Markdown for one update. Phase changes the user does not care about
/// render as nothing.
pub fn render_update(update: &TaskUpdate) -> Option<String> {
    match update {
        TaskUpdate::Phase { phase, detail, .. } => render_phase(*phase, detail.as_deref()),
        TaskUpdate::Event(event) => Some(render_event(event)),
        TaskUpdate::Finished(report) => Some(render_summary(report)),
    }
}

fn render_phase(phase: VmPhase, detail: Option<&str>) -> Option<String> {
    let icon = match phase {
        VmPhase::Requested | VmPhase::ConfigInjected | VmPhase::Cleanup => return None,
        VmPhase::Provisioning | VmPhase::WaitingReady => "⏳",
        VmPhase::Running => "🤖",
        VmPhase::Polling => return Some("## 📝 Agent Progress\n\n".to_string()),
        VmPhase::Destroyed => "🧹",
        VmPhase::Failed => "⚠️",
    };
    let mut line = format!("{icon} **{}**", phase.describe());
    if let Some(detail) = detail {
        line.push_str(": ");
        line.push_str(detail);
    }
    line.push_str("\n\n");
    Some(line)
}

pub fn render_event(event: &ProgressEvent) -> String {
    let icon = match event.kind {
        EventKind::Info => "ℹ️",
        EventKind::Tool => "🔧",
        EventKind::Thought => "💭",
        EventKind::Error => "❌",
        EventKind::Done => "🏁",
    };
    let time = event.timestamp.format("%H:%M:%S");
    let mut line = format!("`{time}` {icon} {}", first_line(&event.message));
    match &event.payload {
        Some(EventPayload::Command { command, exit_code: Some(code) }) if *code != 0 => {
            line.push_str(&format!(" (`{}` exited {code})", first_line(command)));
        }
        Some(EventPayload::PolicyViolation { rule, .. }) => {
            line.push_str(&format!(" [rule: {}]", rule.as_str()));
        }
        _ => {}
    }
    line.push('\n');
    line
}

pub fn render_summary(report: &TaskReport) -> String {
    let outcome = &report.outcome;
    let mut out = String::from("\n---\n\n");

    match outcome.status {
        TerminalStatus::Succeeded => {
            out.push_str("## ✅ Task Completed Successfully\n\n");
            if let Some(commit) = &outcome.commit {
                out.push_str(&format!("**Commit:** `{commit}`\n"));
            }
            if !outcome.reason.is_empty() {
                out.push_str(&format!("\n**Summary:** {}\n", outcome.reason));
            }
        }
        TerminalStatus::Failed | TerminalStatus::TimedOut => {
            let title = if outcome.status == TerminalStatus::TimedOut {
                "## ⏱️ Task Timed Out\n\n"
            } else {
                "## ❌ Task Failed\n\n"
            };
            out.push_str(title);
            if let Some(kind) = outcome.error_kind {
                out.push_str(&format!("**{}** (`{}`)\n\n", kind.user_message(), kind.as_str()));
            }
            out.push_str(&format!("**Cause:** {}\n", outcome.reason));
        }
    }

    let files = &outcome.files_changed;
    if !files.is_empty() {
        out.push_str(&format!("\n**Files Changed:** {}\n\n", files.len()));
        for file in files.iter().take(MAX_LISTED_FILES) {
            out.push_str(&format!("  - `{file}`\n"));
        }
        if files.len() > MAX_LISTED_FILES {
            out.push_str(&format!("  - ... and {} more\n", files.len() - MAX_LISTED_FILES));
        }
    }

    out.push('\n');
    out.push_str(&match &report.cleanup {
        CleanupStatus::Destroyed => match report.vm_id {
            Some(vm_id) => format!("🧹 Agent VM `{vm_id}` destroyed.\n"),
            None => "🧹 Agent VM destroyed.\n".to_string(),
        },
        CleanupStatus::NotProvisioned => "No VM was provisioned.\n".to_string(),
        CleanupStatus::DestroyFailed(e) => {
            format!("⚠️ **The agent VM could not be destroyed** ({e}). An operator must remove it.\n")
        }
    });
    out
}

/// Reply for a coding request that names no supported repository.
pub fn render_missing_repository() -> String {
    "## 🔍 Repository Required\n\n\
     I detected a coding task request, but I need a repository URL to work on.\n\n\
     ```\nImplement user authentication in https://github.com/user/repo\n```\n\n\
     Or specify a branch:\n\n\
     ```\nAdd a REST API to https://github.com/user/repo branch: develop\n```\n\n\
     Supported hosts: github.com, gitlab.com, bitbucket.org.\n"
        .to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ErrorKind, TaskOutcome};
    use chrono::Utc;
    use std::time::Duration;

    fn report(outcome: TaskOutcome, cleanup: CleanupStatus) -> TaskReport {
        TaskReport {
            task_id: "t".into(),
            vm_id: Some(10004),
            vm_name: Some("agent-t".into()),
            final_phase: VmPhase::Destroyed,
            outcome,
            cleanup,
            events_relayed: 3,
            duration: Duration::from_secs(42),
        }
    }

    #[test]
    fn test_success_summary_lists_first_ten_files() {
        let files: Vec<String> = (0..12).map(|i| format!("src/f{i}.rs")).collect();
        let outcome = TaskOutcome::succeeded("Added feature", files, Some("abc1234".into()));
        let text = render_summary(&report(outcome, CleanupStatus::Destroyed));

        assert!(text.contains("Task Completed Successfully"));
        assert!(text.contains("`abc1234`"));
        assert!(text.contains("`src/f9.rs`"));
        assert!(!text.contains("`src/f10.rs`"));
        assert!(text.contains("... and 2 more"));
        assert!(text.contains("`10004` destroyed"));
    }

    #[test]
    fn test_failure_summary_names_kind_and_leak() {
        let outcome = TaskOutcome::failed(ErrorKind::CommitError, "push rejected: no write access");
        let text = render_summary(&report(
            outcome,
            CleanupStatus::DestroyFailed("VM is locked".into()),
        ));
        assert!(text.contains("commit_error"));
        assert!(text.contains("push rejected"));
        assert!(text.contains("could not be destroyed"));
    }

    #[test]
    fn test_phase_rendering() {
        let update = TaskUpdate::Phase {
            phase: VmPhase::Provisioning,
            at: Utc::now(),
            detail: None,
        };
        assert!(render_update(&update).unwrap().contains("Provisioning agent VM"));

        let update = TaskUpdate::Phase {
            phase: VmPhase::Cleanup,
            at: Utc::now(),
            detail: None,
        };
        assert!(render_update(&update).is_none());
    }

    #[test]
    fn test_event_line() {
        let event = ProgressEvent {
            seq: 4,
            timestamp: Utc::now(),
            kind: EventKind::Tool,
            message: "run_command: cargo test\nmore".into(),
            payload: Some(EventPayload::Command {
                command: "cargo test".into(),
                exit_code: Some(101),
            }),
        };
        let line = render_event(&event);
        assert!(line.contains("🔧 run_command: cargo test"));
        assert!(line.contains("exited 101"));
        assert!(!line.contains("more"));
    }
}
