//! Reader for the assistant's on-disk session index, plus the project-path
//! encoding it shares with transcript locations.
//!
//! The assistant keeps per-project state under
//! `~/.claude/projects/<encoded-path>/`, where the encoded name is the
//! project path with `/` replaced by `-` (so `/Users/foo/bar` becomes
//! `-Users-foo-bar`). `sessions-index.json` inside that directory carries
//! display metadata we fold into our session rows.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

use crate::error::{PulseError, Result};
use crate::store;

#[derive(Debug, Default, Deserialize)]
struct SessionsIndex {
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub custom_title: Option<String>,
    #[serde(default)]
    pub first_prompt: Option<String>,
    #[serde(default)]
    pub message_count: Option<i64>,
}

/// `~/.claude/projects`, the root of the assistant's per-project state.
pub fn claude_projects_dir() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or(PulseError::HomeDirNotFound)?
        .join(".claude")
        .join("projects"))
}

/// Encodes a project path the way the assistant names its directories.
pub fn encoded_project_dir(project_path: &str) -> String {
    project_path.replace('/', "-")
}

/// Recovers the project path from a transcript location, e.g.
/// `.../projects/-Users-foo-bar/x.jsonl` → `/Users/foo/bar`.
/// Returns `None` when the transcript path has no usable parent name.
pub fn derive_project_path(transcript_path: &str) -> Option<String> {
    if transcript_path.is_empty() {
        return None;
    }
    let encoded = Path::new(transcript_path).parent()?.file_name()?.to_str()?;
    Some(encoded.replace('-', "/"))
}

/// Looks up one session in the project's sessions-index.json.
pub fn index_entry(projects_dir: &Path, project_path: &str, session_id: &str) -> Option<IndexEntry> {
    let index_path = projects_dir
        .join(encoded_project_dir(project_path))
        .join("sessions-index.json");

    let text = fs_err::read_to_string(index_path).ok()?;
    let index: SessionsIndex = serde_json::from_str(&text).ok()?;
    index
        .entries
        .into_iter()
        .find(|entry| entry.session_id.as_deref() == Some(session_id))
}

/// Enriches a session row from the index: name from
/// `customTitle || firstPrompt`, plus the message count. Missing index
/// files or entries only produce a log line.
pub fn apply_to_session(
    conn: &Connection,
    projects_dir: &Path,
    project_path: &str,
    session_id: &str,
) -> Result<()> {
    let Some(entry) = index_entry(projects_dir, project_path, session_id) else {
        store::log(
            conn,
            "No session entry found in index",
            json!({"session_id": session_id, "project_path": project_path}),
        )?;
        return Ok(());
    };

    let name = entry.custom_title.or(entry.first_prompt);
    store::log(
        conn,
        "Updating session metadata from index",
        json!({
            "session_id": session_id,
            "project_path": project_path,
            "name": &name,
            "message_count": entry.message_count,
        }),
    )?;
    store::update_session_metadata(conn, session_id, name.as_deref(), entry.message_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn encodes_and_derives_project_paths() {
        assert_eq!(encoded_project_dir("/Users/foo/bar"), "-Users-foo-bar");
        assert_eq!(
            derive_project_path("/Users/apo/.claude/projects/-Users-apo-code-pulse/abc.jsonl")
                .as_deref(),
            Some("/Users/apo/code/pulse")
        );
        assert_eq!(derive_project_path(""), None);
    }

    fn write_index(projects_dir: &Path, project_path: &str, body: &str) {
        let dir = projects_dir.join(encoded_project_dir(project_path));
        fs_err::create_dir_all(&dir).unwrap();
        fs_err::write(dir.join("sessions-index.json"), body).unwrap();
    }

    #[test]
    fn finds_entry_by_session_id() {
        let home = tempdir().unwrap();
        write_index(
            home.path(),
            "/p",
            r#"{"entries": [
                {"sessionId": "other"},
                {"sessionId": "s1", "customTitle": "My work", "messageCount": 12}
            ]}"#,
        );

        let entry = index_entry(home.path(), "/p", "s1").unwrap();
        assert_eq!(entry.custom_title.as_deref(), Some("My work"));
        assert_eq!(entry.message_count, Some(12));
        assert!(index_entry(home.path(), "/p", "missing").is_none());
        assert!(index_entry(home.path(), "/unknown", "s1").is_none());
    }

    #[test]
    fn custom_title_beats_first_prompt() {
        let home = tempdir().unwrap();
        let db = tempdir().unwrap();
        let config = Config::at(db.path(), Duration::from_secs(2));
        let conn = store::open(&config).unwrap();
        let project_id = store::upsert_project(&conn, "/p").unwrap();
        store::upsert_session(&conn, "s1", project_id, "started", "/t", None, None).unwrap();

        write_index(
            home.path(),
            "/p",
            r#"{"entries": [{"sessionId": "s1", "customTitle": "Title",
                            "firstPrompt": "first words", "messageCount": 3}]}"#,
        );
        apply_to_session(&conn, home.path(), "/p", "s1").unwrap();
        let session = store::get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref(), Some("Title"));
        assert_eq!(session.message_count, Some(3));
    }

    #[test]
    fn falls_back_to_first_prompt_and_tolerates_missing_index() {
        let home = tempdir().unwrap();
        let db = tempdir().unwrap();
        let config = Config::at(db.path(), Duration::from_secs(2));
        let conn = store::open(&config).unwrap();
        let project_id = store::upsert_project(&conn, "/p").unwrap();
        store::upsert_session(&conn, "s1", project_id, "started", "/t", None, None).unwrap();

        // No index at all: logged, no error.
        apply_to_session(&conn, home.path(), "/p", "s1").unwrap();

        write_index(
            home.path(),
            "/p",
            r#"{"entries": [{"sessionId": "s1", "firstPrompt": "first words"}]}"#,
        );
        apply_to_session(&conn, home.path(), "/p", "s1").unwrap();
        let session = store::get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(session.name.as_deref(), Some("first words"));
        assert_eq!(session.message_count, None);
    }
}
