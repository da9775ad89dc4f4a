//! Running shell commands in the workspace with a timeout and bounded output.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Captured result of one shell command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    /// `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Render for the model, in the same layout for every command.
    pub fn render(&self, max_chars: usize) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let mut text = format!(
            "Exit code: {}\nStdout:\n{}\nStderr:\n{}",
            code, self.stdout, self.stderr
        );
        if self.timed_out {
            text.push_str(&format!(
                "\n(Command timed out after {}s and was killed)",
                self.duration.as_secs()
            ));
        }
        truncate_text(&text, max_chars)
    }
}

/// Run `command` through `sh -c` in `cwd`.
///
/// The child is killed when `timeout` elapses or when the returned future is
/// dropped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    output_limit: usize,
) -> std::io::Result<ShellOutput> {
    let started = Instant::now();
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("CI", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    debug!(command, "spawned shell command");
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(ShellOutput {
                exit_code: output.status.code(),
                stdout: truncate_text(&String::from_utf8_lossy(&output.stdout), output_limit),
                stderr: truncate_text(&String::from_utf8_lossy(&output.stderr), output_limit),
                timed_out: false,
                duration: started.elapsed(),
            })
        }
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "command timed out, killed");
            Ok(ShellOutput {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                duration: started.elapsed(),
            })
        }
    }
}

/// Keep at most `max_chars` characters, noting how much was cut.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n... [truncated {} characters]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("echo hello && echo oops >&2 && exit 3", dir.path(), Duration::from_secs(10), 1000)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_shell("sleep 30", dir.path(), Duration::from_millis(200), 1000)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.duration < Duration::from_secs(10));
        assert!(out.render(1000).contains("timed out"));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        let long = "x".repeat(25);
        let cut = truncate_text(&long, 10);
        assert!(cut.starts_with("xxxxxxxxxx\n"));
        assert!(cut.contains("truncated 15 characters"));
    }
}
