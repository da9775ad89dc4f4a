//! Recognizing coding tasks in chat messages.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref TASK_TRIGGERS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(implement|create|build|develop|code|write)\b.*\b(feature|function|class|module|api|endpoint)\b")
            .expect("valid trigger regex"),
        Regex::new(r"(?i)\b(add|fix|update|refactor|modify)\b.*\b(code|file|function|bug|issue)\b")
            .expect("valid trigger regex"),
        Regex::new(r"(?i)^\s*/(code|implement|build)\s+").expect("valid trigger regex"),
    ];
    static ref ANY_FORGE_URL: Regex =
        Regex::new(r"(?i)https?://(?:github|gitlab|bitbucket)\.[a-z]+/").expect("valid url regex");
    static ref REPO_URL: Regex = Regex::new(
        r"(?i)https?://(?:github\.com|gitlab\.com|bitbucket\.org)/[\w\-.]+/[\w\-.]+"
    )
    .expect("valid repo regex");
    static ref BRANCH_PATTERNS: Vec<Regex> = vec![
        Regex::new(r#"(?i)\bon\s+(?:the\s+)?["']?([A-Za-z0-9_\-/.]+)["']?\s+branch\b"#)
            .expect("valid branch regex"),
        Regex::new(r#"(?i)\bbranch[:\s]+["']?([A-Za-z0-9_\-/.]+)["']?"#).expect("valid branch regex"),
    ];
    static ref BRANCH_CLAUSE: Regex = Regex::new(
        r#"(?i)(\bon\s+(?:the\s+)?["']?[A-Za-z0-9_\-/.]+["']?\s+branch\b|\bbranch:\s*["']?[A-Za-z0-9_\-/.]+["']?)"#
    )
    .expect("valid branch regex");
    static ref ANY_URL: Regex = Regex::new(r"https?://\S+").expect("valid url regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("valid whitespace regex");
}

const ACTION_WORDS: &[&str] = &[
    "implement", "add", "create", "fix", "update", "build", "modify", "change",
];
const PREFIXES: &[&str] = &["/code", "/implement", "/build", "please", "can you", "could you"];
const DANGLING: &[&str] = &["in", "to", "for", "on", "at", "of", "from"];

pub const DEFAULT_BRANCH: &str = "main";

/// Repository, branch and description pulled out of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRequest {
    pub repository_url: String,
    pub branch: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Detection {
    /// Ordinary chat; not for us.
    NotATask,
    /// Looks like a coding task but names no supported repository.
    MissingRepository,
    Task(TaskRequest),
}

pub fn is_coding_task(message: &str) -> bool {
    if TASK_TRIGGERS.iter().any(|re| re.is_match(message)) {
        return true;
    }
    if ANY_FORGE_URL.is_match(message) {
        let lower = message.to_lowercase();
        return ACTION_WORDS.iter().any(|word| lower.contains(word));
    }
    false
}

/// First supported repository URL (without `.git`) and the requested branch.
pub fn extract_repository(message: &str) -> Option<(String, String)> {
    let found = REPO_URL.find(message)?;
    let url = found.as_str().trim_end_matches(['.', ',']);
    let url = url.strip_suffix(".git").unwrap_or(url).to_string();

    let branch = BRANCH_PATTERNS
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('.').to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    Some((url, branch))
}

/// The message minus URLs, branch clauses and polite or command prefixes.
pub fn extract_description(message: &str) -> String {
    let without_urls = ANY_URL.replace_all(message, " ");
    let without_branch = BRANCH_CLAUSE.replace_all(&without_urls, " ");
    let mut description = WHITESPACE
        .replace_all(without_branch.trim(), " ")
        .to_string();

    loop {
        let lower = description.to_lowercase();
        let Some(prefix) = PREFIXES.iter().find(|p| lower.starts_with(*p)) else {
            break;
        };
        description = description[prefix.len()..]
            .trim_start_matches([',', ':'])
            .trim()
            .to_string();
    }

    let trimmed = description.trim_end_matches(['.', ',', ' ']);
    let mut words: Vec<&str> = trimmed.split(' ').collect();
    while words
        .last()
        .is_some_and(|w| DANGLING.contains(&w.to_lowercase().as_str()))
    {
        words.pop();
    }
    let description = words.join(" ");

    if description.is_empty() {
        message.trim().to_string()
    } else {
        description
    }
}

pub fn detect(message: &str) -> Detection {
    if !is_coding_task(message) {
        return Detection::NotATask;
    }
    match extract_repository(message) {
        Some((repository_url, branch)) => Detection::Task(TaskRequest {
            repository_url,
            branch,
            description: extract_description(message),
        }),
        None => Detection::MissingRepository,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_action_with_code_noun() {
        assert!(is_coding_task("Please implement a new API endpoint for users"));
        assert!(is_coding_task("fix the bug in the login function"));
        assert!(is_coding_task("/code dark mode"));
        assert!(!is_coding_task("What's the weather like?"));
        assert!(!is_coding_task("Tell me about https://github.com/rust-lang/rust"));
    }

    #[test]
    fn test_repository_url_needs_action_word() {
        assert!(is_coding_task("Add JWT auth to https://github.com/user/api"));
        assert!(is_coding_task("change the readme in https://gitlab.com/team/docs"));
    }

    #[test]
    fn test_extract_repository_and_branch() {
        let (url, branch) =
            extract_repository("Fix the login bug in https://github.com/user/webapp.git branch: bugfix")
                .unwrap();
        assert_eq!(url, "https://github.com/user/webapp");
        assert_eq!(branch, "bugfix");

        let (url, branch) =
            extract_repository("Add tests to https://bitbucket.org/team/svc on the release/2.0 branch please")
                .unwrap();
        assert_eq!(url, "https://bitbucket.org/team/svc");
        assert_eq!(branch, "release/2.0");

        let (_, branch) = extract_repository("Update https://github.com/a/b.").unwrap();
        assert_eq!(branch, "main");

        assert!(extract_repository("fix https://example.com/a/b").is_none());
    }

    #[test]
    fn test_description_cleanup() {
        assert_eq!(
            extract_description("/code implement dark mode in https://github.com/user/frontend"),
            "implement dark mode"
        );
        assert_eq!(
            extract_description("Please add a REST API to https://github.com/user/repo branch: develop"),
            "add a REST API"
        );
        assert_eq!(extract_description("https://github.com/u/r"), "https://github.com/u/r");
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect("hello there"), Detection::NotATask);
        assert_eq!(detect("implement a new feature please"), Detection::MissingRepository);
        match detect("Add JWT authentication to https://github.com/user/api") {
            Detection::Task(request) => {
                assert_eq!(request.repository_url, "https://github.com/user/api");
                assert_eq!(request.branch, "main");
                assert_eq!(request.description, "Add JWT authentication");
            }
            other => panic!("expected a task, got {other:?}"),
        }
    }
}
