//! Checked-out repository the agent edits.
//!
//! Every file operation goes through [`RepoWorkspace`], which confines paths
//! to the repository root. Git tracks the changes, so the full change is
//! always recoverable as a byte-exact patch.

use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::git::{Git, GitError};

const MAX_LIST_ENTRIES: usize = 1000;
const MAX_SEARCH_MATCHES: usize = 200;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("absolute paths are not allowed: {0}")]
    AbsolutePath(String),
    #[error("path escapes the repository: {0}")]
    PathEscape(String),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error("{0} is not a UTF-8 text file")]
    NotText(String),
    #[error("{0} is a directory")]
    IsDirectory(String),
    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Git(#[from] GitError),
}

/// One line matched by [`RepoWorkspace::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

pub struct RepoWorkspace {
    root: PathBuf,
    branch: String,
    git: Git,
    max_file_size: u64,
}

impl RepoWorkspace {
    pub fn new(git: Git, branch: impl Into<String>, max_file_size: u64) -> Result<Self, WorkspaceError> {
        let root = git.workdir().canonicalize()?;
        Ok(Self {
            root,
            branch: branch.into(),
            git,
            max_file_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Resolve a repository-relative path, refusing anything outside the root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = relative.trim();
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(WorkspaceError::AbsolutePath(relative.to_string()));
        }

        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(WorkspaceError::PathEscape(relative.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(WorkspaceError::AbsolutePath(relative.to_string()))
                }
            }
        }
        if normalized.components().next().map(|c| c.as_os_str() == ".git").unwrap_or(false) {
            return Err(WorkspaceError::PathEscape(relative.to_string()));
        }

        // every existing component, links included, must resolve inside the root
        let mut current = self.root.clone();
        for part in normalized.components() {
            current.push(part);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => match current.canonicalize() {
                    Ok(real) if real.starts_with(&self.root) => {}
                    // dangling links count as escapes: the target is created on write
                    _ => return Err(WorkspaceError::PathEscape(relative.to_string())),
                },
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.root.join(&normalized))
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// List a directory; hidden entries are skipped and directories end in `/`.
    pub fn list_files(&self, relative: &str, recursive: bool) -> Result<Vec<String>, WorkspaceError> {
        let dir = self.resolve(if relative.trim().is_empty() { "." } else { relative })?;
        if !dir.exists() {
            return Err(WorkspaceError::NotFound(relative.to_string()));
        }
        let mut entries = Vec::new();
        self.collect_entries(&dir, recursive, &mut entries)?;
        entries.sort();
        entries.truncate(MAX_LIST_ENTRIES);
        Ok(entries)
    }

    fn collect_entries(&self, dir: &Path, recursive: bool, out: &mut Vec<String>) -> Result<(), WorkspaceError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                out.push(format!("{}/", self.display(&path)));
                if recursive && out.len() < MAX_LIST_ENTRIES {
                    self.collect_entries(&path, true, out)?;
                }
            } else {
                out.push(self.display(&path));
            }
            if out.len() >= MAX_LIST_ENTRIES {
                break;
            }
        }
        Ok(())
    }

    pub fn read_file(&self, relative: &str) -> Result<String, WorkspaceError> {
        let path = self.resolve(relative)?;
        if !path.exists() {
            return Err(WorkspaceError::NotFound(relative.to_string()));
        }
        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            return Err(WorkspaceError::IsDirectory(relative.to_string()));
        }
        if meta.len() > self.max_file_size {
            return Err(WorkspaceError::TooLarge {
                path: relative.to_string(),
                size: meta.len(),
                limit: self.max_file_size,
            });
        }
        let bytes = fs::read(&path)?;
        String::from_utf8(bytes).map_err(|_| WorkspaceError::NotText(relative.to_string()))
    }

    /// Write (create or replace) a file; returns the byte count.
    pub fn write_file(&self, relative: &str, content: &str) -> Result<u64, WorkspaceError> {
        let size = content.len() as u64;
        if size > self.max_file_size {
            return Err(WorkspaceError::TooLarge {
                path: relative.to_string(),
                size,
                limit: self.max_file_size,
            });
        }
        let path = self.resolve(relative)?;
        if path.is_dir() {
            return Err(WorkspaceError::IsDirectory(relative.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        debug!(path = %self.display(&path), bytes = size, "wrote file");
        Ok(size)
    }

    /// Regex search over text files under `relative`.
    pub fn search(&self, pattern: &str, relative: &str) -> Result<Vec<SearchMatch>, WorkspaceError> {
        let regex = Regex::new(pattern)?;
        let start = self.resolve(if relative.trim().is_empty() { "." } else { relative })?;
        let mut matches = Vec::new();
        self.search_in(&regex, &start, &mut matches)?;
        Ok(matches)
    }

    fn search_in(&self, regex: &Regex, path: &Path, out: &mut Vec<SearchMatch>) -> Result<(), WorkspaceError> {
        if out.len() >= MAX_SEARCH_MATCHES {
            return Ok(());
        }
        let meta = fs::symlink_metadata(path)?;
        if meta.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                self.search_in(regex, &entry.path(), out)?;
            }
            return Ok(());
        }
        if !meta.is_file() || meta.len() > self.max_file_size {
            return Ok(());
        }
        let Ok(text) = fs::read_to_string(path) else {
            return Ok(());
        };
        for (index, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                out.push(SearchMatch {
                    path: self.display(path),
                    line_number: index + 1,
                    line: line.chars().take(200).collect(),
                });
                if out.len() >= MAX_SEARCH_MATCHES {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Every changed path relative to HEAD, including untracked files.
    pub async fn changed_files(&self) -> Result<Vec<String>, WorkspaceError> {
        self.git.add_all().await?;
        Ok(self.git.staged_files().await?)
    }

    /// Binary-safe patch of the whole working tree against HEAD, as raw bytes.
    ///
    /// Applying it to a fresh clone of the same branch reproduces the tree
    /// byte for byte, whatever the files' encoding.
    pub async fn diff_patch(&self) -> Result<Vec<u8>, WorkspaceError> {
        self.git.add_all().await?;
        Ok(self.git.diff_cached_binary().await?)
    }

    pub async fn diff_stat(&self) -> Result<String, WorkspaceError> {
        self.git.add_all().await?;
        Ok(self.git.diff_cached_stat().await?)
    }

    /// Apply a patch from [`RepoWorkspace::diff_patch`] to this workspace.
    pub async fn apply_patch(&self, patch: &[u8]) -> Result<(), WorkspaceError> {
        let patch_file = tempfile_path(&self.root);
        fs::write(&patch_file, patch)?;
        let result = self.git.apply(&patch_file).await;
        let _ = fs::remove_file(&patch_file);
        Ok(result?)
    }
}

fn tempfile_path(root: &Path) -> PathBuf {
    root.join(".git").join(format!("codevisor-{}.patch", uuid::Uuid::now_v7()))
}
