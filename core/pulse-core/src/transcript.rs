//! Transcript parsing: JSON-lines bytes → typed records.
//!
//! The transcript is append-only from the assistant's perspective but may
//! be rewritten wholesale between reads, so parsing is a pure function over
//! a full snapshot. Malformed lines (including a partial line at EOF) are
//! skipped; only opening the file can fail.
//!
//! Three entry kinds are consumed: `user`, `assistant` and `custom-title`.
//! Everything else, and any unknown field, is ignored.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PulseError, Result};

/// Markers of assistant-injected user entries (local command echo etc.)
/// which must never surface as real user messages.
const SYNTHETIC_MARKERS: [&str; 3] = [
    "<local-command-stdout>",
    "<local-command-caveat>",
    "<command-name>",
];

/// A text-bearing message in document order.
#[derive(Debug, Clone)]
pub struct TextRecord {
    pub uuid: String,
    pub timestamp: Option<String>,
    pub body: String,
    pub is_user: bool,
    pub is_thinking: bool,
    pub images: Vec<ImageContent>,
}

/// An inline image attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContent {
    pub media_type: String,
    pub data: String,
}

/// A tool invocation, keyed by the tool-use id (not the entry uuid).
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub timestamp: Option<String>,
}

/// The matching result for a tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Option<String>,
    pub is_error: bool,
    pub answers: Option<Value>,
}

/// Everything extracted from one transcript snapshot.
#[derive(Debug, Default)]
pub struct Transcript {
    pub records: Vec<TextRecord>,
    pub tool_uses: Vec<ToolUse>,
    pub tool_results: HashMap<String, ToolResult>,
    pub custom_title: Option<String>,
}

/// Reads and parses a transcript file.
pub fn parse_file(path: &Path) -> Result<Transcript> {
    let text = fs_err::read_to_string(path)
        .map_err(|e| PulseError::io(format!("read transcript {}", path.display()), e))?;
    Ok(parse_str(&text))
}

/// Parses transcript text. Pure; never fails.
pub fn parse_str(text: &str) -> Transcript {
    let mut transcript = Transcript::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        match entry.get("type").and_then(|v| v.as_str()) {
            Some("user") => parse_user_entry(&entry, &mut transcript),
            Some("assistant") => parse_assistant_entry(&entry, &mut transcript),
            Some("custom-title") => {
                if let Some(title) = entry
                    .get("title")
                    .or_else(|| entry.get("customTitle"))
                    .and_then(|v| v.as_str())
                {
                    // Last one wins.
                    transcript.custom_title = Some(title.to_string());
                }
            }
            _ => {}
        }
    }

    transcript
}

fn parse_user_entry(entry: &Value, transcript: &mut Transcript) {
    let message = entry.get("message");
    if message.and_then(|m| m.get("role")).and_then(|r| r.as_str()) != Some("user") {
        return;
    }
    let content = message.and_then(|m| m.get("content"));

    match content {
        Some(Value::String(text)) => {
            if text.is_empty() || is_synthetic(text) {
                return;
            }
            push_text_record(entry, transcript, text.clone(), true, false, Vec::new());
        }
        Some(Value::Array(items)) => {
            let mut text_parts: Vec<&str> = Vec::new();
            let mut images = Vec::new();
            let answers = entry
                .get("toolUseResult")
                .and_then(|r| r.get("answers"))
                .cloned();

            for item in items {
                match item.get("type").and_then(|v| v.as_str()) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                            text_parts.push(text);
                        }
                    }
                    Some("image") => {
                        let source = item.get("source");
                        let media_type = source
                            .and_then(|s| s.get("media_type"))
                            .and_then(|v| v.as_str())
                            .unwrap_or("image/png");
                        if let Some(data) =
                            source.and_then(|s| s.get("data")).and_then(|v| v.as_str())
                        {
                            images.push(ImageContent {
                                media_type: media_type.to_string(),
                                data: data.to_string(),
                            });
                        }
                    }
                    Some("tool_result") => {
                        let Some(id) = item.get("tool_use_id").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        transcript.tool_results.insert(
                            id.to_string(),
                            ToolResult {
                                content: tool_result_text(item.get("content")),
                                is_error: item
                                    .get("is_error")
                                    .and_then(|v| v.as_bool())
                                    .unwrap_or(false),
                                answers: answers.clone(),
                            },
                        );
                    }
                    _ => {}
                }
            }

            let body = text_parts.join("\n");
            if (body.is_empty() && images.is_empty()) || is_synthetic(&body) {
                return;
            }
            push_text_record(entry, transcript, body, true, false, images);
        }
        _ => {}
    }
}

fn parse_assistant_entry(entry: &Value, transcript: &mut Transcript) {
    let Some(message) = entry.get("message") else {
        return;
    };
    if message.get("role").and_then(|r| r.as_str()) != Some("assistant")
        || message.get("type").and_then(|t| t.as_str()) != Some("message")
    {
        return;
    }
    let Some(items) = message.get("content").and_then(|c| c.as_array()) else {
        return;
    };

    let timestamp = entry
        .get("timestamp")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    for item in items {
        if item.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
            let (Some(id), Some(name)) = (
                item.get("id").and_then(|v| v.as_str()),
                item.get("name").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            transcript.tool_uses.push(ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: item.get("input").cloned().unwrap_or(Value::Null),
                timestamp: timestamp.clone(),
            });
        }
    }

    // The first content item decides the message kind.
    let Some(first) = items.first() else {
        return;
    };
    match first.get("type").and_then(|v| v.as_str()) {
        Some("thinking") => {
            if let Some(body) = first.get("thinking").and_then(|v| v.as_str()) {
                if !body.is_empty() {
                    push_text_record(entry, transcript, body.to_string(), false, true, Vec::new());
                }
            }
        }
        Some("text") => {
            if let Some(body) = first.get("text").and_then(|v| v.as_str()) {
                if !body.is_empty() {
                    push_text_record(entry, transcript, body.to_string(), false, false, Vec::new());
                }
            }
        }
        _ => {}
    }
}

fn push_text_record(
    entry: &Value,
    transcript: &mut Transcript,
    body: String,
    is_user: bool,
    is_thinking: bool,
    images: Vec<ImageContent>,
) {
    let Some(uuid) = entry.get("uuid").and_then(|v| v.as_str()) else {
        return;
    };
    transcript.records.push(TextRecord {
        uuid: uuid.to_string(),
        timestamp: entry
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        body,
        is_user,
        is_thinking,
        images,
    });
}

/// Extracts plain text from a tool_result content field, which is either a
/// bare string or a list of text items.
fn tool_result_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
                .collect();
            Some(parts.join("\n"))
        }
        _ => None,
    }
}

pub fn is_synthetic(text: &str) -> bool {
    SYNTHETIC_MARKERS.iter().any(|marker| text.contains(marker))
}
