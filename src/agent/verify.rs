//! Detection of the repository's test/build command.

use std::path::Path;

use tracing::debug;

/// Pick the verification command for the repository at `root`.
///
/// An explicit command wins; otherwise the first matching project marker
/// decides. `None` means the repository has nothing to verify with.
pub fn detect_verify_command(root: &Path, explicit: Option<&str>) -> Option<String> {
    if let Some(command) = explicit.map(str::trim).filter(|c| !c.is_empty()) {
        return Some(command.to_string());
    }

    let detected = if root.join("Cargo.toml").is_file() {
        Some("cargo test")
    } else if has_npm_test_script(&root.join("package.json")) {
        Some("npm test")
    } else if root.join("go.mod").is_file() {
        Some("go test ./...")
    } else if ["pyproject.toml", "setup.py", "pytest.ini"]
        .iter()
        .any(|marker| root.join(marker).is_file())
    {
        Some("python3 -m pytest -q")
    } else {
        None
    };
    debug!(command = ?detected, "detected verification command");
    detected.map(str::to_string)
}

/// `npm init` writes a placeholder test script that always fails; it does not count.
fn has_npm_test_script(package_json: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(package_json) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
        return false;
    };
    value
        .get("scripts")
        .and_then(|s| s.get("test"))
        .and_then(|t| t.as_str())
        .map(|script| !script.trim().is_empty() && !script.contains("no test specified"))
        .unwrap_or(false)
}
