//! Chat wire types, agent tool schemas and the text fallback parser.
//!
//! Message shapes follow the OpenAI chat-completions format, which Open WebUI
//! and most self-hosted gateways speak.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    /// Result of the tool call identified by `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role("tool", content)
        }
    }

    /// Native tool calls, if the model produced any.
    pub fn native_tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// A tool call from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// Function call details.
///
/// On the wire `arguments` is a JSON-encoded string; some servers send a
/// plain object instead. Both decode into a [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(
        default,
        serialize_with = "arguments_as_string",
        deserialize_with = "arguments_from_any"
    )]
    pub arguments: Value,
}

fn arguments_as_string<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Value::String(raw) => serializer.serialize_str(raw),
        other => serializer.serialize_str(&other.to_string()),
    }
}

fn arguments_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(raw) if raw.trim().is_empty() => json!({}),
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Value::Null => json!({}),
        other => other,
    })
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

fn tool(name: &str, description: &str, parameters: Value) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: ToolFunction {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// Tools offered to the coding agent.
pub fn agent_tools() -> Vec<Tool> {
    vec![
        tool(
            "list_files",
            "List files and directories in the repository. Paths are relative to the repository root.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory to list (default: repository root)"},
                    "recursive": {"type": "boolean", "description": "List subdirectories too"}
                }
            }),
        ),
        tool(
            "read_file",
            "Read the contents of a file in the repository.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to the repository root"}
                },
                "required": ["path"]
            }),
        ),
        tool(
            "write_file",
            "Create or overwrite a file with the given content. Parent directories are created.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to the repository root"},
                    "content": {"type": "string", "description": "Complete new file content"}
                },
                "required": ["path", "content"]
            }),
        ),
        tool(
            "search_files",
            "Search file contents with a regular expression.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression to search for"},
                    "path": {"type": "string", "description": "Directory to search (default: repository root)"}
                },
                "required": ["pattern"]
            }),
        ),
        tool(
            "run_command",
            "Run a shell command in the repository root. Only package managers, language runtimes, read-only file tools and git are permitted.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"}
                },
                "required": ["command"]
            }),
        ),
        tool(
            "git_status",
            "List changed and untracked files.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "git_diff",
            "Show the current uncommitted changes.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "task_complete",
            "Declare the task finished. Tests are run before the changes are committed.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "What was changed and why"},
                    "commit_message": {"type": "string", "description": "Git commit message for the change"}
                },
                "required": ["summary", "commit_message"]
            }),
        ),
    ]
}

/// Try to parse tool calls from the response content text
///
/// This handles models that output tool calls as JSON in the text
/// instead of using the native tool_calls field.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let mut tool_calls = Vec::new();
    let content = content.trim();

    if let Some(tool_call) = try_parse_tool_call(content) {
        tool_calls.push(tool_call);
    } else {
        scan_for_tool_calls(content, &mut tool_calls);
    }

    for (index, call) in tool_calls.iter_mut().enumerate() {
        call.id = format!("text_call_{index}");
    }
    tool_calls
}

/// Look for balanced `{...}` spans that might be tool calls.
fn scan_for_tool_calls(content: &str, tool_calls: &mut Vec<ToolCall>) {
    let mut depth = 0usize;
    let mut start = None;
    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push(tool_call);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return parse_tool_call_from_value(&value);
    }
    // Fallback: unescaped quotes inside a long string argument
    let fixed = try_fix_malformed_json(json_str)?;
    let value = serde_json::from_str::<Value>(&fixed).ok()?;
    parse_tool_call_from_value(&value)
}

/// Escape stray double quotes inside the last string argument of a call
/// such as `{"name": "write_file", "arguments": {"path": "a", "content": "say "hi""}}`.
fn try_fix_malformed_json(json_str: &str) -> Option<String> {
    let marker_end = ["\"content\": \"", "\"command\": \"", "\"content\":\"", "\"command\":\""]
        .iter()
        .find_map(|marker| json_str.find(marker).map(|pos| pos + marker.len()))?;

    let remaining = &json_str[marker_end..];
    let end_pattern = remaining.rfind("\"}}")?;
    let raw_value = &remaining[..end_pattern];

    let escaped = raw_value
        .replace("\\\"", "\u{FFFF}")
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    Some(format!(
        "{}{}{}",
        &json_str[..marker_end],
        escaped,
        &remaining[end_pattern..]
    ))
}

fn parse_tool_call_from_value(value: &Value) -> Option<ToolCall> {
    // {"function": {"name": ..., "arguments": ...}}
    if let Some(function) = value.get("function").filter(|f| f.is_object()) {
        return parse_tool_call_from_value(function);
    }

    let name = value
        .get("name")
        .or_else(|| value.get("tool"))
        .and_then(|n| n.as_str())?;

    // Some models use "parameters" instead of "arguments"
    let arguments = value.get("arguments").or_else(|| value.get("parameters"))?;
    let arguments = match arguments {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), unwrap_schema_value(v)))
                .collect(),
        ),
        _ => return None,
    };

    Some(ToolCall::new(String::new(), name, arguments))
}

/// Malformed calls sometimes mix schema into values: `{"path": {"value": "x"}}`.
fn unwrap_schema_value(value: &Value) -> Value {
    match value.get("value") {
        Some(inner) if value.as_object().is_some_and(|o| o.len() <= 3) => inner.clone(),
        _ => value.clone(),
    }
}
