//! Hook installation into Claude Code's settings.json.
//!
//! Only our own entries are ever added; existing settings are left
//! untouched and installation is idempotent. Writes are atomic
//! (temp file + rename) so a crash cannot corrupt the settings file.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;

/// Hook events Pulse subscribes to, with the matcher where one is required.
const HOOK_EVENTS: [(&str, Option<&str>); 7] = [
    ("SessionStart", None),
    ("UserPromptSubmit", None),
    ("PreToolUse", Some("*")),
    ("PostToolUse", Some("*")),
    ("Notification", Some("*")),
    ("Stop", None),
    ("SessionEnd", None),
];

pub fn run(settings_path: Option<PathBuf>) -> Result<(), String> {
    let settings_path = match settings_path {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let command = hook_command()?;

    let mut settings = load_settings(&settings_path)?;
    let (added, skipped) = install_hooks(&mut settings, &command);
    save_settings(&settings_path, &settings)?;

    println!("Installed hook command: {command}");
    println!("  Added: {} ({})", added.len(), added.join(", "));
    println!("  Skipped: {} ({})", skipped.len(), skipped.join(", "));
    println!("Settings saved to: {}", settings_path.display());
    Ok(())
}

fn default_settings_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".claude").join("settings.json"))
}

fn hook_command() -> Result<String, String> {
    let exe = std::env::current_exe()
        .map_err(|err| format!("Cannot resolve pulse-hook executable: {err}"))?;
    Ok(format!("{} handle", exe.display()))
}

fn load_settings(path: &Path) -> Result<Value, String> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let text = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read {}: {err}", path.display()))?;
    serde_json::from_str(&text).map_err(|err| format!("Settings file is not valid JSON: {err}"))
}

/// Adds missing hook entries in place. Returns (added, skipped) event names.
fn install_hooks(settings: &mut Value, command: &str) -> (Vec<String>, Vec<String>) {
    if !settings.is_object() {
        *settings = json!({});
    }
    let root = settings.as_object_mut().expect("settings forced to object");
    let hooks = root
        .entry("hooks".to_string())
        .or_insert_with(|| json!({}));
    if !hooks.is_object() {
        *hooks = json!({});
    }
    let hooks = hooks.as_object_mut().expect("hooks forced to object");

    let mut added = Vec::new();
    let mut skipped = Vec::new();

    for (event, matcher) in HOOK_EVENTS {
        let entries = hooks
            .entry(event.to_string())
            .or_insert_with(|| json!([]));
        if !entries.is_array() {
            *entries = json!([]);
        }
        let entries = entries.as_array_mut().expect("entries forced to array");

        if hook_exists(entries, command, matcher) {
            skipped.push(event.to_string());
            continue;
        }
        entries.push(hook_entry(command, matcher));
        added.push(event.to_string());
    }

    (added, skipped)
}

fn hook_entry(command: &str, matcher: Option<&str>) -> Value {
    let mut entry = Map::new();
    if let Some(matcher) = matcher {
        entry.insert("matcher".to_string(), json!(matcher));
    }
    entry.insert(
        "hooks".to_string(),
        json!([{ "type": "command", "command": command }]),
    );
    Value::Object(entry)
}

fn hook_exists(entries: &[Value], command: &str, matcher: Option<&str>) -> bool {
    entries.iter().any(|entry| {
        if let Some(matcher) = matcher {
            if entry.get("matcher").and_then(|m| m.as_str()) != Some(matcher) {
                return false;
            }
        }
        entry
            .get("hooks")
            .and_then(|h| h.as_array())
            .is_some_and(|hooks| {
                hooks.iter().any(|hook| {
                    hook.get("type").and_then(|t| t.as_str()) == Some("command")
                        && hook.get("command").and_then(|c| c.as_str()) == Some(command)
                })
            })
    })
}

fn save_settings(path: &Path, settings: &Value) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| "Settings path has no parent".to_string())?;
    fs_err::create_dir_all(parent)
        .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|err| format!("Failed to create temp settings file: {err}"))?;
    let body = serde_json::to_string_pretty(settings)
        .map_err(|err| format!("Failed to encode settings: {err}"))?;
    temp.write_all(body.as_bytes())
        .map_err(|err| format!("Failed to write settings: {err}"))?;
    temp.persist(path)
        .map_err(|err| format!("Failed to replace settings file: {err}"))?;
    Ok(())
}
