//! Tool-call projection: raw (tool_use, tool_result) pairs → compact
//! summary JSON for the dashboard.
//!
//! Every summary carries `{tool_use_id, name, status}`; the rest of the
//! shape is tool-specific. Outputs are clamped to [`MAX_OUTPUT_CHARS`] so a
//! single Bash command cannot bloat the store. Projection never fails:
//! anything unexpected degrades to an error summary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use similar::TextDiff;

use crate::transcript::{ToolResult, ToolUse};

/// Truncation threshold for tool output, written content and diffs.
pub const MAX_OUTPUT_CHARS: usize = 50_000;

const TRUNCATION_SUFFIX: &str = "\n... [truncated]";
const DIFF_TOO_LARGE: &str = "[Diff too large to display]";

/// One entry of a TodoWrite list. Extra fields (`activeForm`, ...) are
/// irrelevant to identity and dropped on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: String,
}

impl Todo {
    pub fn new(content: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: status.into(),
        }
    }
}

/// Decodes the `todos` array from a TodoWrite input. Malformed entries
/// decode to empty strings rather than failing the projection.
pub fn parse_todos(input: &Value) -> Vec<Todo> {
    input
        .get("todos")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Content-addressed identity of a todo set: stable across tool-call ids,
/// prompts, item order and reprocessing. Status is deliberately excluded.
pub fn todo_identity(session_id: &str, todos: &[Todo]) -> String {
    let mut contents: Vec<&str> = todos.iter().map(|t| t.content.as_str()).collect();
    contents.sort_unstable();
    let digest = md5::compute(format!("{}|{}", session_id, contents.join("|")));
    format!("{digest:x}")
}

/// Digest of the status vector, used to detect progress between two
/// sightings of the same todo set.
pub fn todo_state_key(todos: &[Todo]) -> String {
    let statuses: Vec<&str> = todos.iter().map(|t| t.status.as_str()).collect();
    let digest = md5::compute(statuses.join("|"));
    format!("{digest:x}")
}

/// Projects a tool invocation into its summary JSON.
pub fn project(tool_use: &ToolUse, result: Option<&ToolResult>) -> Value {
    match project_inner(tool_use, result) {
        Ok(summary) => summary,
        Err(reason) => json!({
            "tool_use_id": tool_use.id,
            "name": tool_use.name,
            "status": "error",
            "input": {},
            "output": format!("[Error processing tool: {reason}]"),
            "output_truncated": false,
        }),
    }
}

fn project_inner(tool_use: &ToolUse, result: Option<&ToolResult>) -> Result<Value, String> {
    let input = &tool_use.input;
    let status = if result.is_some_and(|r| r.is_error) {
        "error"
    } else {
        "success"
    };
    let output = result.and_then(|r| r.content.clone()).unwrap_or_default();

    let mut summary = match tool_use.name.as_str() {
        "Bash" => {
            let (output, truncated) = truncate_output(&output);
            json!({
                "input": {
                    "command": str_field(input, "command"),
                    "description": str_field(input, "description"),
                },
                "output": output,
                "output_truncated": truncated,
            })
        }
        "Edit" => project_edit(input)?,
        "Read" => json!({
            "input": {
                "file_path": str_field(input, "file_path"),
                "offset": input.get("offset").cloned().unwrap_or(Value::Null),
                "limit": input.get("limit").cloned().unwrap_or(Value::Null),
            },
            "output_truncated": output.chars().count() > MAX_OUTPUT_CHARS,
        }),
        "Write" => {
            let content = str_field(input, "content");
            let (content, truncated) = truncate_output(&content);
            json!({
                "input": { "file_path": str_field(input, "file_path") },
                "content": content,
                "content_truncated": truncated,
            })
        }
        "Grep" | "Glob" => {
            let (output, truncated) = truncate_output(&output);
            json!({
                "input": {
                    "pattern": str_field(input, "pattern"),
                    "path": str_field(input, "path"),
                    "glob": str_field(input, "glob"),
                    "output_mode": str_field(input, "output_mode"),
                },
                "output": output,
                "output_truncated": truncated,
            })
        }
        "Task" => {
            let (output, truncated) = truncate_output(&output);
            json!({
                "input": {
                    "description": str_field(input, "description"),
                    "subagent_type": str_field(input, "subagent_type"),
                },
                "output": output,
                "output_truncated": truncated,
            })
        }
        "TodoWrite" => {
            let todos = parse_todos(input);
            json!({
                "input": { "todos": input.get("todos").cloned().unwrap_or(Value::Null) },
                "state_key": todo_state_key(&todos),
            })
        }
        _ => {
            let (output, truncated) = truncate_output(&output);
            json!({
                "input": input.clone(),
                "output": output,
                "output_truncated": truncated,
            })
        }
    };

    let object = summary
        .as_object_mut()
        .ok_or_else(|| "summary is not an object".to_string())?;
    object.insert("tool_use_id".into(), json!(tool_use.id));
    object.insert("name".into(), json!(tool_use.name));
    object.insert("status".into(), json!(status));
    if let Some(answers) = result.and_then(|r| r.answers.clone()) {
        object.insert("answers".into(), answers);
    }

    Ok(summary)
}

fn project_edit(input: &Value) -> Result<Value, String> {
    let old = str_field(input, "old_string");
    let new = str_field(input, "new_string");
    let file_path = str_field(input, "file_path");
    let file_name = Path::new(&file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_path.as_str());

    let text_diff = TextDiff::from_lines(old.as_str(), new.as_str());
    let mut diff = text_diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{file_name}"), &format!("b/{file_name}"))
        .to_string();

    let lines_added = diff
        .lines()
        .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
        .count();
    let lines_removed = diff
        .lines()
        .filter(|l| l.starts_with('-') && !l.starts_with("---"))
        .count();

    let mut diff_truncated = false;
    if diff.chars().count() > MAX_OUTPUT_CHARS {
        diff = DIFF_TOO_LARGE.to_string();
        diff_truncated = true;
    }

    Ok(json!({
        "input": {
            "file_path": file_path,
            "replace_all": input.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false),
        },
        "diff": diff,
        "lines_added": lines_added,
        "lines_removed": lines_removed,
        "diff_truncated": diff_truncated,
    }))
}

fn str_field(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn truncate_output(text: &str) -> (String, bool) {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((byte_offset, _)) => {
            let mut truncated = text[..byte_offset].to_string();
            truncated.push_str(TRUNCATION_SUFFIX);
            (truncated, true)
        }
        None => (text.to_string(), false),
    }
}
