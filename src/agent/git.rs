//! Git adapter for the agent workspace.
//!
//! A small, explicit wrapper around `git` subprocess calls. Prompts are
//! disabled so a missing credential fails fast instead of hanging the VM.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Why a clone failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFailure {
    MissingBranch,
    Authentication,
    Network,
    NotFound,
    Other,
}

impl CloneFailure {
    /// Classify `git clone` stderr.
    pub fn classify(stderr: &str) -> Self {
        let s = stderr.to_ascii_lowercase();
        if s.contains("remote branch") && s.contains("not found") {
            CloneFailure::MissingBranch
        } else if s.contains("repository not found")
            || s.contains("does not appear to be a git repository")
            || s.contains("does not exist")
        {
            CloneFailure::NotFound
        } else if s.contains("authentication failed")
            || s.contains("could not read username")
            || s.contains("permission denied")
            || s.contains("terminal prompts disabled")
        {
            CloneFailure::Authentication
        } else if s.contains("could not resolve host")
            || s.contains("connection refused")
            || s.contains("connection timed out")
            || s.contains("network is unreachable")
            || s.contains("unable to access")
        {
            CloneFailure::Network
        } else {
            CloneFailure::Other
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            CloneFailure::MissingBranch => "branch does not exist",
            CloneFailure::Authentication => "authentication failed",
            CloneFailure::Network => "network error",
            CloneFailure::NotFound => "repository not found",
            CloneFailure::Other => "clone failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {args} failed (exit {code:?}): {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{}: {}", .kind.describe(), .stderr)]
    Clone { kind: CloneFailure, stderr: String },
    #[error("git {0} timed out")]
    Timeout(String),
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `git clone --branch <branch> --single-branch <url> <dest>`.
    #[instrument(skip_all, fields(url = %url, branch = %branch))]
    pub async fn clone_repo(
        url: &str,
        branch: &str,
        dest: &Path,
        timeout: Duration,
    ) -> Result<Git, GitError> {
        let dest_str = dest.to_string_lossy().to_string();
        let args = [
            "clone",
            "--branch",
            branch,
            "--single-branch",
            "--",
            url,
            dest_str.as_str(),
        ];
        let output = run_git(None, &args, timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let kind = CloneFailure::classify(&stderr);
            warn!(?kind, "clone failed");
            return Err(GitError::Clone { kind, stderr });
        }
        debug!(dest = %dest.display(), "cloned repository");
        Ok(Git::new(dest).with_timeout(timeout))
    }

    async fn run(&self, args: &[&str]) -> Result<Output, GitError> {
        run_git(Some(&self.workdir), args, self.timeout).await
    }

    /// Run git and return stdout, failing on a non-zero exit.
    pub async fn run_checked(&self, args: &[&str]) -> Result<String, GitError> {
        let stdout = self.run_raw(args).await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Like [`Git::run_checked`] but keeps stdout as bytes.
    pub async fn run_raw(&self, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    pub async fn configure_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run_checked(&["config", "user.name", name]).await?;
        self.run_checked(&["config", "user.email", email]).await?;
        Ok(())
    }

    /// Status entries (including untracked) in porcelain format.
    pub async fn status_porcelain(&self) -> Result<Vec<StatusEntry>, GitError> {
        let out = self.run_checked(&["status", "--porcelain=v1", "-uall"]).await?;
        Ok(out.lines().filter_map(parse_status_line).collect())
    }

    /// Stage all changes (respects .gitignore).
    pub async fn add_all(&self) -> Result<(), GitError> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    pub async fn has_staged_changes(&self) -> Result<bool, GitError> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"]).await?;
        Ok(!out.trim().is_empty())
    }

    /// Names of staged files.
    pub async fn staged_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"]).await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    /// Binary-safe patch of the index against HEAD. Not decoded: text
    /// files in legacy encodings must survive untouched.
    pub async fn diff_cached_binary(&self) -> Result<Vec<u8>, GitError> {
        self.run_raw(&["diff", "--cached", "--binary", "HEAD"]).await
    }

    pub async fn diff_cached_stat(&self) -> Result<String, GitError> {
        self.run_checked(&["diff", "--cached", "--stat", "HEAD"]).await
    }

    /// Apply a patch produced by [`Git::diff_cached_binary`] to the working tree.
    pub async fn apply(&self, patch_file: &Path) -> Result<(), GitError> {
        let path = patch_file.to_string_lossy().to_string();
        self.run_checked(&["apply", "--binary", path.as_str()]).await?;
        Ok(())
    }

    /// Commit staged changes and return the new HEAD sha.
    #[instrument(skip_all)]
    pub async fn commit(&self, message: &str) -> Result<String, GitError> {
        self.run_checked(&["commit", "-m", message]).await?;
        self.head_sha().await
    }

    pub async fn head_sha(&self) -> Result<String, GitError> {
        Ok(self.run_checked(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }

    /// `git push origin HEAD:<branch>`.
    #[instrument(skip_all, fields(branch = %branch))]
    pub async fn push(&self, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:{branch}");
        self.run_checked(&["push", "origin", refspec.as_str()]).await?;
        Ok(())
    }
}

async fn run_git(workdir: Option<&Path>, args: &[&str], timeout: Duration) -> Result<Output, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(GitError::Timeout(args.first().copied().unwrap_or("").to_string())),
    }
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if line.len() < 4 {
        return None;
    }
    let code = line.get(..2)?.to_string();
    let raw = line.get(3..)?;
    // renames are reported as "old -> new"
    let path = raw.rsplit(" -> ").next().unwrap_or(raw).trim_matches('"').to_string();
    Some(StatusEntry { code, path })
}

/// True when a usable `git` binary is on PATH.
pub async fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
